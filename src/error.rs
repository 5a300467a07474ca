//! Error types for the coordination service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelperError {
    /// Malformed input: an OSC payload or a settings file that cannot be
    /// used. Logged and discarded at the boundary.
    #[error("invalid {what}: {reason}")]
    Validation { what: String, reason: String },

    /// The control plane could not bind its UDP port. Fatal at startup.
    #[error("OSC listener could not bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("segment error: {0}")]
    Segment(#[from] m1_memshare::MemShareError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HelperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HelperError::Validation {
            what: "OSC payload".into(),
            reason: "missing port argument".into(),
        };
        assert!(err.to_string().contains("missing port argument"));

        let err = HelperError::Bind {
            port: 6346,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("6346"));
    }
}
