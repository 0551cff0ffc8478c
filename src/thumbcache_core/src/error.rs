//! Error types for thumbcache_core.

use thiserror::Error;

/// Error types for cache, decode and scheduler operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Corrupt or unsupported image data.
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// Missing or locked file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Illegal reconfiguration, e.g. changing the lane count after the first request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    /// The key kind has no decode path (virtual key without a source).
    #[error("Unsupported item: {0}")]
    Unsupported(String),
}

impl CacheError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        CacheError::Configuration(msg.into())
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: CacheError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, CacheError::Io(_)));
        assert_eq!(err.to_string(), "IO error: gone");
    }

    #[test]
    fn test_configuration_message() {
        let err = CacheError::configuration("lanes are fixed after start");
        assert_eq!(
            err.to_string(),
            "Configuration error: lanes are fixed after start"
        );
    }
}
