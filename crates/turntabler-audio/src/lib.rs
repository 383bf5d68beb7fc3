pub mod capture;
pub mod format;
pub mod jitter;
pub mod ring;
pub mod source;

// Public API
pub use capture::{CaptureConfig, CpalSource};
pub use format::AudioFormat;
pub use jitter::{CaptureSession, JitterBuffer, OverflowPolicy, Pop};
pub use source::{CaptureSource, FileSource, SyntheticSource};
