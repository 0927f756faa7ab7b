//! Error types for scribe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScribeError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Persistence errors
    #[error("Persisted blob exceeds storage capacity")]
    PersistCapacity,

    #[error("Persistence failed: {message}")]
    Persist { message: String },

    #[error("Persisted blob is corrupt: {0}")]
    PersistCorrupt(#[from] serde_json::Error),

    // Lifecycle errors
    #[error("Completion cascade exceeded depth {depth}, refusing re-entrant call")]
    ReentrancyLimit { depth: u32 },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ScribeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = ScribeError::ConfigFileNotFound {
            path: "/path/to/scribe.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /path/to/scribe.toml"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = ScribeError::ConfigInvalidValue {
            key: "store.max_records".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for store.max_records: must be positive"
        );
    }

    #[test]
    fn test_persist_capacity_display() {
        assert_eq!(
            ScribeError::PersistCapacity.to_string(),
            "Persisted blob exceeds storage capacity"
        );
    }

    #[test]
    fn test_reentrancy_limit_display() {
        let error = ScribeError::ReentrancyLimit { depth: 8 };
        assert_eq!(
            error.to_string(),
            "Completion cascade exceeded depth 8, refusing re-entrant call"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: ScribeError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: ScribeError = json_error.into();
        assert!(error.to_string().contains("corrupt"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ScribeError>();
        assert_sync::<ScribeError>();
    }
}
