pub mod stream_metrics;

pub use stream_metrics::*;
