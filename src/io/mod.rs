//! I/O utilities: relay buffers and the bidirectional relay future

pub mod buffer;
pub mod relay;

pub use buffer::{clamp_buffer_size, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
pub use relay::{relay, relay_with_buffer, Direction, RelayResult};
