//! Error types and result handling for pg-relay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! The taxonomy follows the pipeline's recovery behavior: infrastructure
//! failures (Kafka, Postgres connectivity) are retried by the gateway and
//! consumer workers, data failures ([`Error::InvalidMessage`],
//! [`Error::Conversion`]) fail the enclosing message and route it to the
//! dead-letter topic, and startup failures ([`Error::Config`],
//! [`Error::Authentication`]) abort the process.

use thiserror::Error;

/// The main error type for pg-relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file or environment overrides.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client, producer, or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding or decoding envelopes.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// XML deserialization error in a DDL event payload.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material missing or unusable at startup.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Invalid or malformed message content; fails the whole message.
    #[error("Invalid message: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A row value could not be coerced to the target column's type.
    #[error("Conversion failed for row {row}, column {column}: {reason}")]
    Conversion {
        /// Zero-based index of the row within the message
        row: usize,
        /// Target column name
        column: String,
        /// What went wrong
        reason: String,
    },

    /// A delete entry carried no usable primary-key value, or a merge
    /// target has no primary key at all.
    #[error("No primary key available for entry {index} (table {table})")]
    MissingPrimaryKey {
        /// Zero-based index of the entry within the message
        index: usize,
        /// Target table name
        table: String,
    },

    /// Operation timeout (publish confirm, batch deadline).
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the pipeline loops.
    #[error("Shutdown requested")]
    Shutdown,
}

/// A convenient Result type alias for pg-relay operations.
pub type Result<T> = std::result::Result<T, Error>;
