use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Audio subsystem error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Streaming endpoint error: {0}")]
    Http(String),

    #[error("Shutdown requested")]
    ShutdownRequested,

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Capture device not found: {name:?}")]
    DeviceNotFound { name: Option<String> },

    #[error("Capture device disconnected")]
    DeviceDisconnected,

    #[error("Format not supported: {format}")]
    FormatNotSupported { format: String },

    /// Samples were lost at the driver before the application read them.
    /// Recoverable: the data is already gone, capture itself is intact.
    #[error("Driver overrun, lost {samples} samples")]
    Overrun { samples: usize },

    #[error("Source is closed")]
    SourceClosed,

    #[error("CPAL error: {0}")]
    Cpal(#[from] cpal::StreamError),

    #[error("Build stream error: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Play stream error: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Supported stream configs error: {0}")]
    SupportedStreamConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("Device enumeration error: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

impl AudioError {
    /// Transient errors are logged by the producer loop and capture continues.
    /// Everything else ends the capture session.
    pub fn is_transient(&self) -> bool {
        matches!(self, AudioError::Overrun { .. })
    }
}

#[derive(Debug, Clone)]
pub enum RecoveryStrategy {
    Retry { max_attempts: u32, delay: Duration },
    Ignore,
    Fatal,
}

impl AppError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            AppError::Audio(AudioError::Overrun { .. }) => RecoveryStrategy::Ignore,
            AppError::Audio(AudioError::DeviceDisconnected) => RecoveryStrategy::Retry {
                max_attempts: 5,
                delay: Duration::from_secs(2),
            },
            _ => RecoveryStrategy::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrun_is_transient() {
        assert!(AudioError::Overrun { samples: 1024 }.is_transient());
        assert!(!AudioError::DeviceDisconnected.is_transient());
        assert!(!AudioError::SourceClosed.is_transient());
    }

    #[test]
    fn overrun_recovery_is_ignore() {
        let err = AppError::Audio(AudioError::Overrun { samples: 512 });
        assert!(matches!(err.recovery_strategy(), RecoveryStrategy::Ignore));
    }
}
