use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line overrides. Anything left unset falls back to the config
/// file, then to built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(
    name = "turntabler",
    version,
    about = "Stream a turntable's line-in audio as an endless WAV over HTTP"
)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address for the HTTP server.
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port for the HTTP server.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Where the audio comes from.
    #[arg(long, value_enum)]
    pub source: Option<SourceArg>,

    /// Input device name for the live source; system default when omitted.
    #[arg(short, long)]
    pub device: Option<String>,

    /// WAV file to loop for the file source.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Capture sample rate in Hz.
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Capture channel count.
    #[arg(long)]
    pub channels: Option<u16>,

    /// Stream name advertised to renderers in the icy-name header.
    #[arg(long)]
    pub stream_name: Option<String>,

    /// Jitter buffer depth in milliseconds.
    #[arg(long)]
    pub buffer_ms: Option<u64>,

    /// Startup prefill target in milliseconds.
    #[arg(long)]
    pub prefill_ms: Option<u64>,

    /// What to do when the jitter buffer is full.
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowArg>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceArg {
    /// Capture from a cpal input device.
    Live,
    /// Generated sine tone, for bring-up without hardware.
    Synthetic,
    /// Loop a WAV file at capture cadence.
    File,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowArg {
    /// Evict the oldest chunk so the newest audio keeps flowing.
    DropOldest,
    /// Back-pressure the producer; only sane for file or synthetic sources.
    Block,
}
