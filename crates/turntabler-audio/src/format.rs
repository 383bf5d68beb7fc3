use std::time::Duration;

use turntabler_foundation::AudioError;

/// Immutable PCM stream descriptor. All fields are fixed for the lifetime
/// of one streaming session; byte order is always little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    /// 48 kHz stereo 16-bit, the native format of common USB phono interfaces.
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Result<Self, AudioError> {
        if sample_rate == 0 || channels == 0 {
            return Err(AudioError::FormatNotSupported {
                format: format!("{}Hz, {}ch", sample_rate, channels),
            });
        }
        if !matches!(bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(AudioError::FormatNotSupported {
                format: format!("{}-bit samples", bits_per_sample),
            });
        }
        Ok(Self {
            sample_rate,
            channels,
            bits_per_sample,
        })
    }

    /// Bytes per sample frame (one sample for every channel).
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Bytes per second of audio.
    pub fn byte_rate(&self) -> usize {
        self.frame_bytes() * self.sample_rate as usize
    }

    /// Network bandwidth of the raw stream in Mbps.
    pub fn bandwidth_mbps(&self) -> f64 {
        (self.byte_rate() as f64 * 8.0) / 1_000_000.0
    }

    /// Frame-aligned byte count covering `duration` of audio.
    pub fn bytes_for_duration(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as u128 * duration.as_millis()) / 1000;
        frames as usize * self.frame_bytes()
    }

    /// Playback duration of `len` bytes of audio in this format.
    pub fn duration_of_bytes(&self, len: usize) -> Duration {
        let frames = len / self.frame_bytes();
        Duration::from_nanos((frames as u64 * 1_000_000_000) / self.sample_rate as u64)
    }
}
