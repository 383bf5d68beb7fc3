use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use turntabler_foundation::AudioError;

use crate::format::AudioFormat;
use crate::ring::{RingReader, RingWriter, SampleRing};
use crate::source::CaptureSource;

/// Capture parameters negotiated once at session start. Period size and
/// period count follow the USB-audio recommendations for vinyl capture
/// (1024 frames is ~21 ms at 48 kHz).
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: Option<String>,
    pub format: AudioFormat,
    pub period_frames: usize,
    pub periods: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            format: AudioFormat::default(),
            period_frames: 1024,
            periods: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Open,
    Capturing,
    Closed,
}

/// Live capture from a cpal input device.
///
/// The cpal stream is owned by a dedicated thread (cpal streams are not
/// `Send`); the callback converts samples to i16 and writes them into a
/// lock-free ring, and `read_chunk` blocks on the ring until one full
/// period is available. State machine: Open on construction, Capturing on
/// the first read, Closed on `close()`.
pub struct CpalSource {
    format: AudioFormat,
    period_frames: usize,
    reader: RingReader,
    state: SourceState,
    stream_thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    capture_enabled: Arc<AtomicBool>,
    stream_failed: Arc<AtomicBool>,
    overrun_samples: Arc<AtomicU64>,
    overruns_reported: u64,
}

impl CpalSource {
    pub fn open(config: CaptureConfig) -> Result<Self, AudioError> {
        if config.format.bits_per_sample != 16 {
            return Err(AudioError::FormatNotSupported {
                format: format!(
                    "live capture requires 16-bit, got {}-bit",
                    config.format.bits_per_sample
                ),
            });
        }

        let ring_samples =
            config.period_frames * config.format.channels as usize * config.periods.max(2) * 4;
        let (writer, reader) = SampleRing::with_capacity(ring_samples);

        let shutdown = Arc::new(AtomicBool::new(false));
        let capture_enabled = Arc::new(AtomicBool::new(false));
        let stream_failed = Arc::new(AtomicBool::new(false));
        let overrun_samples = Arc::new(AtomicU64::new(0));

        let (setup_tx, setup_rx) = mpsc::channel::<Result<(), AudioError>>();

        let thread_cfg = config.clone();
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_enabled = Arc::clone(&capture_enabled);
        let thread_failed = Arc::clone(&stream_failed);
        let thread_overruns = Arc::clone(&overrun_samples);

        let stream_thread = thread::Builder::new()
            .name("cpal-stream".to_string())
            .spawn(move || {
                stream_thread_main(
                    thread_cfg,
                    writer,
                    setup_tx,
                    thread_shutdown,
                    thread_enabled,
                    thread_failed,
                    thread_overruns,
                );
            })
            .map_err(|e| AudioError::Fatal(format!("Failed to spawn cpal thread: {}", e)))?;

        // Device open and config negotiation happen on the stream thread;
        // startup failures propagate synchronously to the caller.
        match setup_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = stream_thread.join();
                return Err(e);
            }
            Err(_) => {
                shutdown.store(true, Ordering::SeqCst);
                let _ = stream_thread.join();
                return Err(AudioError::Fatal(
                    "Timed out waiting for capture device setup".to_string(),
                ));
            }
        }

        tracing::info!(
            "Live capture open: {}Hz, {}ch, period {} frames",
            config.format.sample_rate,
            config.format.channels,
            config.period_frames,
        );

        Ok(Self {
            format: config.format,
            period_frames: config.period_frames,
            reader,
            state: SourceState::Open,
            stream_thread: Some(stream_thread),
            shutdown,
            capture_enabled,
            stream_failed,
            overrun_samples,
            overruns_reported: 0,
        })
    }
}

impl CaptureSource for CpalSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&mut self, _frames: usize) -> Result<Option<Vec<u8>>, AudioError> {
        match self.state {
            SourceState::Closed => return Err(AudioError::SourceClosed),
            SourceState::Open => {
                self.capture_enabled.store(true, Ordering::SeqCst);
                self.state = SourceState::Capturing;
            }
            SourceState::Capturing => {}
        }

        // Always one hardware period per read; the requested size is advisory.
        let needed = self.period_frames * self.format.channels as usize;
        let mut samples = vec![0i16; needed];

        loop {
            if self.stream_failed.load(Ordering::SeqCst) {
                return Err(AudioError::DeviceDisconnected);
            }

            // Surface samples lost in the callback before handing out data;
            // the loss already happened, so this is transient.
            let total_lost = self.overrun_samples.load(Ordering::Relaxed);
            if total_lost > self.overruns_reported {
                let lost = total_lost - self.overruns_reported;
                self.overruns_reported = total_lost;
                return Err(AudioError::Overrun {
                    samples: lost as usize,
                });
            }

            if self.reader.read_exact(&mut samples) {
                let mut chunk = Vec::with_capacity(needed * 2);
                for s in &samples {
                    chunk.extend_from_slice(&s.to_le_bytes());
                }
                return Ok(Some(chunk));
            }

            thread::sleep(Duration::from_millis(1));
        }
    }

    fn close(&mut self) {
        if self.state == SourceState::Closed {
            return;
        }
        self.state = SourceState::Closed;
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
        tracing::info!("Live capture closed");
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_thread_main(
    config: CaptureConfig,
    writer: RingWriter,
    setup_tx: mpsc::Sender<Result<(), AudioError>>,
    shutdown: Arc<AtomicBool>,
    capture_enabled: Arc<AtomicBool>,
    stream_failed: Arc<AtomicBool>,
    overrun_samples: Arc<AtomicU64>,
) {
    let stream = match build_input_stream(
        &config,
        writer,
        Arc::clone(&stream_failed),
        overrun_samples,
    ) {
        Ok(stream) => {
            let _ = setup_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = setup_tx.send(Err(e));
            return;
        }
    };

    let mut playing = false;
    while !shutdown.load(Ordering::SeqCst) {
        if !playing && capture_enabled.load(Ordering::SeqCst) {
            match stream.play() {
                Ok(()) => {
                    tracing::info!("Capture stream started");
                    playing = true;
                }
                Err(e) => {
                    tracing::error!("Failed to start capture stream: {}", e);
                    stream_failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
        thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!("cpal stream thread exiting");
}

fn build_input_stream(
    config: &CaptureConfig,
    mut writer: RingWriter,
    stream_failed: Arc<AtomicBool>,
    overrun_samples: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = match &config.device {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound {
                name: Some(name.clone()),
            })?,
        None => host
            .default_input_device()
            .ok_or(AudioError::DeviceNotFound { name: None })?,
    };
    if let Ok(name) = device.name() {
        tracing::info!("Selected input device: {} (host: {:?})", name, host.id());
    }

    let (stream_config, sample_format) = negotiate_config(&device, config.format)?;

    let err_fn = {
        let stream_failed = Arc::clone(&stream_failed);
        move |err: cpal::StreamError| {
            tracing::error!("Audio stream error: {}", err);
            stream_failed.store(true, Ordering::SeqCst);
        }
    };

    // Push converted samples into the ring; losses are counted and surfaced
    // as overruns from the blocking read side.
    let mut handle_i16 = move |data: &[i16]| {
        let lost = writer.push(data);
        if lost > 0 {
            overrun_samples.fetch_add(lost as u64, Ordering::Relaxed);
            tracing::warn!("Capture ring full, lost {} samples", lost);
        }
    };

    // Thread-local scratch avoids allocating in the audio callback.
    thread_local! {
        static CONVERT_BUFFER: std::cell::RefCell<Vec<i16>> =
            const { std::cell::RefCell::new(Vec::new()) };
    }

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &_| handle_i16(data),
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &_| {
                CONVERT_BUFFER.with(|buf| {
                    let mut converted = buf.borrow_mut();
                    converted.clear();
                    converted.reserve(data.len());
                    for &s in data {
                        converted.push((s.clamp(-1.0, 1.0) * 32767.0).round() as i16);
                    }
                    handle_i16(&converted);
                });
            },
            err_fn,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &_| {
                CONVERT_BUFFER.with(|buf| {
                    let mut converted = buf.borrow_mut();
                    converted.clear();
                    converted.reserve(data.len());
                    for &s in data {
                        converted.push((s as i32 - 32768) as i16);
                    }
                    handle_i16(&converted);
                });
            },
            err_fn,
            None,
        )?,
        other => {
            return Err(AudioError::FormatNotSupported {
                format: format!("{:?}", other),
            });
        }
    };

    Ok(stream)
}

fn negotiate_config(
    device: &cpal::Device,
    format: AudioFormat,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let wanted_rate = SampleRate(format.sample_rate);
    for range in device.supported_input_configs()? {
        if range.channels() == format.channels
            && range.min_sample_rate() <= wanted_rate
            && wanted_rate <= range.max_sample_rate()
        {
            return Ok((
                StreamConfig {
                    channels: format.channels,
                    sample_rate: wanted_rate,
                    buffer_size: cpal::BufferSize::Default,
                },
                range.sample_format(),
            ));
        }
    }

    Err(AudioError::FormatNotSupported {
        format: format!(
            "device does not support {}Hz/{}ch capture",
            format.sample_rate, format.channels
        ),
    })
}

// Live-hardware coverage is opt-in; CI has no capture device.
#[cfg(all(test, feature = "live-hardware-tests"))]
mod live_tests {
    use super::*;

    #[test]
    fn open_read_close_default_device() {
        let mut source = CpalSource::open(CaptureConfig::default()).expect("open default device");
        let fmt = source.format();
        let chunk = loop {
            match source.read_chunk(1024) {
                Ok(Some(chunk)) => break chunk,
                Ok(None) => panic!("live capture signalled end of stream"),
                Err(e) if e.is_transient() => continue,
                Err(e) => panic!("capture failed: {}", e),
            }
        };
        assert_eq!(chunk.len() % fmt.frame_bytes(), 0);
        source.close();
        source.close();
    }
}
