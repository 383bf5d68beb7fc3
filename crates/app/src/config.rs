use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use turntabler_audio::{AudioFormat, OverflowPolicy};
use turntabler_foundation::AppError;
use turntabler_stream::StreamServerConfig;

use crate::cli::{Cli, OverflowArg, SourceArg};

/// Full service configuration. Precedence is built-in defaults, then the
/// TOML file, then command-line flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: ServerSection,
    pub audio: AudioSection,
    pub buffer: BufferSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub stream_name: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5901,
            stream_name: "TurnTabler".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AudioSection {
    pub source: SourceKind,
    /// Input device name for the live source; system default when absent.
    pub device: Option<String>,
    /// WAV file looped by the file source.
    pub file: Option<PathBuf>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per chunk; 1024 is ~21 ms at 48 kHz, one USB period.
    pub chunk_frames: usize,
    pub tone_hz: f64,
    pub tone_amplitude: f64,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            source: SourceKind::Live,
            device: None,
            file: None,
            sample_rate: 48_000,
            channels: 2,
            chunk_frames: 1024,
            tone_hz: 440.0,
            tone_amplitude: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Live,
    Synthetic,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BufferSection {
    pub depth_ms: u64,
    pub prefill_ms: u64,
    pub prefill_timeout_ms: u64,
    pub overflow: OverflowKind,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            depth_ms: 1000,
            prefill_ms: 500,
            prefill_timeout_ms: 5000,
            overflow: OverflowKind::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowKind {
    DropOldest,
    Block,
}

impl Config {
    /// Loads the file if given, otherwise starts from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| AppError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Applies command-line flags on top of the loaded values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(name) = &cli.stream_name {
            self.server.stream_name = name.clone();
        }
        if let Some(source) = cli.source {
            self.audio.source = match source {
                SourceArg::Live => SourceKind::Live,
                SourceArg::Synthetic => SourceKind::Synthetic,
                SourceArg::File => SourceKind::File,
            };
        }
        if let Some(device) = &cli.device {
            self.audio.device = Some(device.clone());
        }
        if let Some(file) = &cli.file {
            self.audio.file = Some(file.clone());
        }
        if let Some(rate) = cli.sample_rate {
            self.audio.sample_rate = rate;
        }
        if let Some(channels) = cli.channels {
            self.audio.channels = channels;
        }
        if let Some(depth) = cli.buffer_ms {
            self.buffer.depth_ms = depth;
        }
        if let Some(prefill) = cli.prefill_ms {
            self.buffer.prefill_ms = prefill;
        }
        if let Some(overflow) = cli.overflow {
            self.buffer.overflow = match overflow {
                OverflowArg::DropOldest => OverflowKind::DropOldest,
                OverflowArg::Block => OverflowKind::Block,
            };
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.audio.source == SourceKind::File && self.audio.file.is_none() {
            return Err(AppError::Config(
                "file source selected but no file path given".to_string(),
            ));
        }
        if self.audio.chunk_frames == 0 {
            return Err(AppError::Config("chunk_frames must be non-zero".to_string()));
        }
        if self.buffer.depth_ms == 0 {
            return Err(AppError::Config("buffer depth_ms must be non-zero".to_string()));
        }
        if self.buffer.prefill_ms > self.buffer.depth_ms {
            return Err(AppError::Config(format!(
                "prefill_ms ({}) exceeds buffer depth_ms ({})",
                self.buffer.prefill_ms, self.buffer.depth_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.audio.tone_amplitude) {
            return Err(AppError::Config(format!(
                "tone_amplitude {} outside 0.0..=1.0",
                self.audio.tone_amplitude
            )));
        }
        Ok(())
    }

    pub fn format(&self) -> Result<AudioFormat, AppError> {
        // Streaming and capture are 16-bit end to end.
        Ok(AudioFormat::new(self.audio.sample_rate, self.audio.channels, 16)?)
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.buffer.overflow {
            OverflowKind::DropOldest => OverflowPolicy::DropOldest,
            OverflowKind::Block => OverflowPolicy::Block,
        }
    }

    pub fn server_config(&self) -> StreamServerConfig {
        StreamServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            stream_name: self.server.stream_name.clone(),
        }
    }

    /// Buffer capacity in chunks covering `depth_ms` of audio, rounded up.
    pub fn capacity_chunks(&self, format: AudioFormat) -> usize {
        let depth_bytes = format.bytes_for_duration(Duration::from_millis(self.buffer.depth_ms));
        let chunk_bytes = self.audio.chunk_frames * format.frame_bytes();
        depth_bytes.div_ceil(chunk_bytes).max(1)
    }

    /// Prefill target in chunks; the buffer itself clamps to capacity.
    pub fn prefill_chunks(&self, format: AudioFormat) -> usize {
        let prefill_bytes = format.bytes_for_duration(Duration::from_millis(self.buffer.prefill_ms));
        let chunk_bytes = self.audio.chunk_frames * format.frame_bytes();
        prefill_bytes / chunk_bytes
    }

    pub fn prefill_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer.prefill_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_conventions() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5901);
        assert_eq!(config.server.stream_name, "TurnTabler");
        assert_eq!(config.audio.source, SourceKind::Live);
        assert_eq!(config.audio.chunk_frames, 1024);
        assert_eq!(config.buffer.depth_ms, 1000);
        assert_eq!(config.buffer.prefill_ms, 500);
        assert_eq!(config.buffer.overflow, OverflowKind::DropOldest);
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [audio]
            source = "synthetic"
            sample_rate = 44100

            [buffer]
            depth_ms = 2000
            overflow = "block"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0"); // untouched default
        assert_eq!(config.audio.source, SourceKind::Synthetic);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.buffer.depth_ms, 2000);
        assert_eq!(config.buffer.overflow, OverflowKind::Block);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str("[server]\nporte = 8080\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn cli_flags_win_over_file_values() {
        let mut config: Config = toml::from_str("[server]\nport = 8080\n").unwrap();
        let cli = Cli {
            port: Some(9000),
            source: Some(SourceArg::Synthetic),
            buffer_ms: Some(1500),
            ..Default::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.audio.source, SourceKind::Synthetic);
        assert_eq!(config.buffer.depth_ms, 1500);
    }

    #[test]
    fn file_source_requires_a_path() {
        let mut config = Config::default();
        config.audio.source = SourceKind::File;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
        config.audio.file = Some(PathBuf::from("side-a.wav"));
        config.validate().unwrap();
    }

    #[test]
    fn prefill_deeper_than_buffer_is_rejected() {
        let mut config = Config::default();
        config.buffer.prefill_ms = 1500;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn chunk_capacity_rounds_up() {
        let config = Config::default();
        let format = config.format().unwrap();
        // 1000 ms at 192 kB/s is 192000 bytes; 1024-frame chunks are 4096
        // bytes, so 46.875 chunks rounds up to 47.
        assert_eq!(config.capacity_chunks(format), 47);
        // 500 ms prefill is 23.4 chunks, truncated to 23.
        assert_eq!(config.prefill_chunks(format), 23);
    }
}
