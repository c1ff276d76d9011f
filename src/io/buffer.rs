//! Buffer sizing for relay operations

/// Default relay buffer size (64KB - optimal for most network operations)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum relay buffer size (4KB)
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;

/// Maximum relay buffer size (1MB)
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Clamp a requested buffer size into the supported range
#[must_use]
pub const fn clamp_buffer_size(size: usize) -> usize {
    if size < MIN_BUFFER_SIZE {
        MIN_BUFFER_SIZE
    } else if size > MAX_BUFFER_SIZE {
        MAX_BUFFER_SIZE
    } else {
        size
    }
}
