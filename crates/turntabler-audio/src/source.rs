use std::path::Path;
use std::time::{Duration, Instant};

use turntabler_foundation::AudioError;

use crate::format::AudioFormat;

/// A producer of frame-aligned PCM chunks at a cadence dictated by the
/// underlying source.
///
/// `read_chunk` blocks until data is available and returns:
/// - `Ok(Some(chunk))`: raw interleaved PCM, always a whole number of frames.
///   For live hardware the `frames` argument is advisory; the source returns
///   whatever one hardware period yields.
/// - `Ok(None)`: end of stream. File sources loop and never return this
///   during normal operation.
/// - `Err(e)`: `e.is_transient()` distinguishes a driver overrun (log and
///   continue) from a session-fatal failure.
pub trait CaptureSource: Send {
    fn format(&self) -> AudioFormat;

    fn read_chunk(&mut self, frames: usize) -> Result<Option<Vec<u8>>, AudioError>;

    /// Releases the underlying resource. Idempotent; a closed source fails
    /// subsequent reads with `AudioError::SourceClosed`.
    fn close(&mut self);
}

/// Real-time pacing for sources that have no hardware clock of their own.
///
/// Sleeps until the wall-clock instant at which the requested frames would
/// have been captured by real hardware, keeping the producer at a fixed
/// cadence instead of spinning.
pub(crate) struct Pacer {
    start: Instant,
    frames_emitted: u64,
    sample_rate: u32,
    enabled: bool,
}

impl Pacer {
    pub(crate) fn new(sample_rate: u32, enabled: bool) -> Self {
        Self {
            start: Instant::now(),
            frames_emitted: 0,
            sample_rate,
            enabled,
        }
    }

    pub(crate) fn wait_for(&mut self, frames: u64) {
        self.frames_emitted += frames;
        if !self.enabled {
            return;
        }
        let due_ns = (self.frames_emitted * 1_000_000_000) / self.sample_rate as u64;
        let due = self.start + Duration::from_nanos(due_ns);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

/// Deterministic sine generator with phase continuity across chunks.
///
/// Stands in for a turntable during tests and bring-up; runs at real-time
/// cadence via a synthetic clock unless pacing is disabled.
pub struct SyntheticSource {
    format: AudioFormat,
    frequency: f64,
    amplitude: f64,
    sample_index: u64,
    pacer: Pacer,
    closed: bool,
}

impl SyntheticSource {
    pub fn new(format: AudioFormat, frequency: f64, amplitude: f64) -> Result<Self, AudioError> {
        Self::build(format, frequency, amplitude, true)
    }

    /// Test constructor: chunks are computed on demand with no pacing.
    pub fn unpaced(format: AudioFormat, frequency: f64, amplitude: f64) -> Result<Self, AudioError> {
        Self::build(format, frequency, amplitude, false)
    }

    fn build(
        format: AudioFormat,
        frequency: f64,
        amplitude: f64,
        paced: bool,
    ) -> Result<Self, AudioError> {
        if format.bits_per_sample != 16 {
            return Err(AudioError::FormatNotSupported {
                format: format!("synthetic source requires 16-bit, got {}-bit", format.bits_per_sample),
            });
        }
        Ok(Self {
            format,
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            sample_index: 0,
            pacer: Pacer::new(format.sample_rate, paced),
            closed: false,
        })
    }
}

impl CaptureSource for SyntheticSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&mut self, frames: usize) -> Result<Option<Vec<u8>>, AudioError> {
        if self.closed {
            return Err(AudioError::SourceClosed);
        }
        if frames == 0 {
            return Ok(Some(Vec::new()));
        }

        self.pacer.wait_for(frames as u64);

        let mut chunk = Vec::with_capacity(frames * self.format.frame_bytes());
        for i in 0..frames as u64 {
            let t = (self.sample_index + i) as f64 / self.format.sample_rate as f64;
            let value = (2.0 * std::f64::consts::PI * self.frequency * t).sin() * self.amplitude;
            let pcm = (value * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
            for _ in 0..self.format.channels {
                chunk.extend_from_slice(&pcm.to_le_bytes());
            }
        }
        self.sample_index += frames as u64;
        Ok(Some(chunk))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Loops the data payload of a WAV file at capture cadence.
///
/// The whole payload is decoded up front so looping never splits a frame or
/// re-reads the header; typical test records are a few MB.
pub struct FileSource {
    format: AudioFormat,
    data: Vec<u8>,
    position: usize,
    pacer: Pacer,
    closed: bool,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P, format: AudioFormat) -> Result<Self, AudioError> {
        Self::build(path, format, true)
    }

    /// Test constructor: reads are not paced to real time.
    pub fn open_unpaced<P: AsRef<Path>>(path: P, format: AudioFormat) -> Result<Self, AudioError> {
        Self::build(path, format, false)
    }

    fn build<P: AsRef<Path>>(path: P, format: AudioFormat, paced: bool) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)
            .map_err(|e| AudioError::Fatal(format!("Failed to open {}: {}", path.display(), e)))?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::FormatNotSupported {
                format: format!(
                    "{}: only 16-bit integer PCM is supported",
                    path.display()
                ),
            });
        }
        if spec.sample_rate != format.sample_rate
            || spec.channels != format.channels
            || spec.bits_per_sample != format.bits_per_sample
        {
            return Err(AudioError::FormatNotSupported {
                format: format!(
                    "{}: file is {}Hz/{}ch/{}-bit, session is {}Hz/{}ch/{}-bit",
                    path.display(),
                    spec.sample_rate,
                    spec.channels,
                    spec.bits_per_sample,
                    format.sample_rate,
                    format.channels,
                    format.bits_per_sample,
                ),
            });
        }

        let mut data = Vec::new();
        for sample in reader.into_samples::<i16>() {
            let s = sample
                .map_err(|e| AudioError::Fatal(format!("Failed to decode {}: {}", path.display(), e)))?;
            data.extend_from_slice(&s.to_le_bytes());
        }
        if data.len() < format.frame_bytes() {
            return Err(AudioError::Fatal(format!(
                "{}: no audio data",
                path.display()
            )));
        }
        // Truncate a trailing partial frame rather than ever emitting one.
        let aligned = data.len() - (data.len() % format.frame_bytes());
        data.truncate(aligned);

        tracing::info!(
            "File source ready: {} ({} bytes, {:?} per loop)",
            path.display(),
            data.len(),
            format.duration_of_bytes(data.len()),
        );

        Ok(Self {
            format,
            data,
            position: 0,
            pacer: Pacer::new(format.sample_rate, paced),
            closed: false,
        })
    }
}

impl CaptureSource for FileSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&mut self, frames: usize) -> Result<Option<Vec<u8>>, AudioError> {
        if self.closed {
            return Err(AudioError::SourceClosed);
        }
        if frames == 0 {
            return Ok(Some(Vec::new()));
        }

        self.pacer.wait_for(frames as u64);

        let want = frames * self.format.frame_bytes();
        let mut chunk = Vec::with_capacity(want);
        while chunk.len() < want {
            let remaining = self.data.len() - self.position;
            let take = remaining.min(want - chunk.len());
            chunk.extend_from_slice(&self.data[self.position..self.position + take]);
            self.position += take;
            if self.position == self.data.len() {
                // Transparent restart: looping never signals end of stream.
                self.position = 0;
            }
        }
        Ok(Some(chunk))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AudioFormat {
        AudioFormat::default()
    }

    fn decode_mono(chunk: &[u8], channels: usize) -> Vec<i16> {
        chunk
            .chunks_exact(2 * channels)
            .map(|frame| i16::from_le_bytes([frame[0], frame[1]]))
            .collect()
    }

    #[test]
    fn synthetic_chunks_are_frame_aligned() {
        let mut src = SyntheticSource::unpaced(format(), 440.0, 0.5).unwrap();
        for frames in [1, 7, 512, 1024] {
            let chunk = src.read_chunk(frames).unwrap().unwrap();
            assert_eq!(chunk.len(), frames * format().frame_bytes());
            assert_eq!(chunk.len() % format().frame_bytes(), 0);
        }
    }

    #[test]
    fn synthetic_phase_is_continuous_across_chunks() {
        let fmt = format();
        let mut split = SyntheticSource::unpaced(fmt, 440.0, 0.5).unwrap();
        let mut whole = SyntheticSource::unpaced(fmt, 440.0, 0.5).unwrap();

        let mut joined = split.read_chunk(300).unwrap().unwrap();
        joined.extend(split.read_chunk(300).unwrap().unwrap());
        let reference = whole.read_chunk(600).unwrap().unwrap();

        // Two consecutive chunks must equal one double-length chunk exactly;
        // any phase reset would show up as a step at sample 300.
        assert_eq!(joined, reference);

        let samples = decode_mono(&joined, fmt.channels as usize);
        let max_step = 2.0 * std::f64::consts::PI * 440.0 / fmt.sample_rate as f64 * 0.5 * 32767.0;
        for pair in samples.windows(2) {
            let step = (pair[1] as f64 - pair[0] as f64).abs();
            assert!(step <= max_step + 1.0, "discontinuity of {} LSB", step);
        }
    }

    #[test]
    fn synthetic_rejects_non_16_bit() {
        let fmt = AudioFormat::new(48_000, 2, 24).unwrap();
        assert!(SyntheticSource::unpaced(fmt, 440.0, 0.5).is_err());
    }

    #[test]
    fn synthetic_read_after_close_fails() {
        let mut src = SyntheticSource::unpaced(format(), 440.0, 0.5).unwrap();
        src.close();
        src.close(); // idempotent
        assert!(matches!(
            src.read_chunk(16),
            Err(AudioError::SourceClosed)
        ));
    }

    fn write_test_wav(frames: u32) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(file.path(), spec).unwrap();
        for i in 0..frames {
            // Ramp makes loop position verifiable.
            let s = (i % 1000) as i16;
            writer.write_sample(s).unwrap();
            writer.write_sample(-s).unwrap();
        }
        writer.finalize().unwrap();
        file
    }

    #[test]
    fn file_source_loops_without_end_of_stream() {
        let fmt = format();
        let file = write_test_wav(100);
        let mut src = FileSource::open_unpaced(file.path(), fmt).unwrap();

        // 100-frame file, 64-frame reads: the third read wraps past the end.
        let mut total = Vec::new();
        for _ in 0..3 {
            let chunk = src.read_chunk(64).unwrap().expect("file source looped");
            assert_eq!(chunk.len(), 64 * fmt.frame_bytes());
            total.extend(chunk);
        }

        // Frame 100 of concatenated output equals frame 0 of the file.
        let frame_bytes = fmt.frame_bytes();
        assert_eq!(
            &total[100 * frame_bytes..101 * frame_bytes],
            &total[0..frame_bytes]
        );
    }

    #[test]
    fn file_source_rejects_format_mismatch() {
        let file = write_test_wav(10);
        let other = AudioFormat::new(44_100, 2, 16).unwrap();
        assert!(matches!(
            FileSource::open_unpaced(file.path(), other),
            Err(AudioError::FormatNotSupported { .. })
        ));
    }

    #[test]
    fn pacer_holds_cadence() {
        let mut pacer = Pacer::new(48_000, true);
        let start = Instant::now();
        // 4800 frames at 48kHz is 100ms of audio.
        pacer.wait_for(4800);
        assert!(start.elapsed() >= Duration::from_millis(95));
    }
}
