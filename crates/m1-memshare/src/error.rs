//! Error types for segment operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemShareError {
    /// The segment header has not been formatted yet, or the mapping is gone.
    #[error("segment not initialized")]
    NotInitialized,

    /// The payload does not fit in the segment's data arena.
    #[error("payload of {requested} bytes does not fit the {arena}-byte arena")]
    ArenaOverflow { requested: usize, arena: usize },

    /// All consumer slots are taken.
    #[error("consumer table full ({max} consumers)")]
    ConsumerTableFull { max: usize },

    /// The calling consumer never registered with this segment.
    #[error("consumer {0} is not registered")]
    ConsumerNotRegistered(u32),

    /// The queue is full and the oldest buffer still awaits acknowledgment,
    /// so the write would have to drop a buffer it must not drop.
    #[error("queue full and oldest buffer still awaits acknowledgment")]
    QueueFull,

    /// Nothing to read.
    #[error("no data available")]
    NoData,

    /// Header or descriptor contents failed validation.
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MemShareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemShareError::ArenaOverflow {
            requested: 5000,
            arena: 4096,
        };
        assert!(err.to_string().contains("5000"));
        assert!(err.to_string().contains("4096"));

        let err = MemShareError::ConsumerNotRegistered(9001);
        assert!(err.to_string().contains("9001"));

        let err = MemShareError::Corrupt("bad magic".into());
        assert!(err.to_string().contains("bad magic"));
    }
}
