pub mod server;
pub mod wav;

pub use server::{build_server, spawn_drain, StreamServerConfig, StreamState, POP_TIMEOUT};
pub use wav::{infinite_wav_header, UNBOUNDED_SIZE, WAV_HEADER_LEN};
