//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Address could not be embedded in an identifier.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// Field name is not usable as a register key or view column.
    #[error("Invalid field name '{0}'")]
    InvalidFieldName(String),

    /// Unknown canonical table name.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Serialized register exceeds the configured capacity.
    #[error("Register is {size} bytes, exceeds capacity of {max} bytes")]
    RegisterTooLarge {
        /// Serialized size in bytes.
        size: usize,
        /// Configured capacity in bytes.
        max: usize,
    },

    /// Serialized register could not be decoded.
    #[error("Malformed register: {0}")]
    MalformedRegister(String),

    /// Register was written by a newer schema than this build understands.
    #[error("Unsupported register schema version {0}")]
    UnsupportedSchemaVersion(u32),

    /// Value could not be canonicalized.
    #[error("Failed to canonicalize value: {0}")]
    Canonicalization(String),
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
