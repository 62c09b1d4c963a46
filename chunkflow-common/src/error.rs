//! Common error types for chunkflow

use thiserror::Error;

/// Common result type for chunkflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by every chunkflow crate
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Invalid caller input (bad intensity, empty preset id, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
