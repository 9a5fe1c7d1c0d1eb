//! Error types for the ingestion core.

use thiserror::Error;

use crate::mesh::crypto::CryptoError;
use crate::mesh::packet::ParseNodeIdError;

/// Ingestion error type
#[derive(Error, Debug)]
pub enum IngestError {
    /// Envelope or payload protobuf could not be parsed
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Envelope did not carry a mesh packet
    #[error("envelope has no packet")]
    MissingPacket,

    /// Gateway id in the envelope is not a node id
    #[error("invalid gateway id: {0}")]
    InvalidGateway(#[from] ParseNodeIdError),

    /// Payload could not be decrypted
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Payload decoded but its contents are unusable for its port
    #[error("payload error: {0}")]
    Payload(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// MQTT client error
    #[error("transport error: {0}")]
    Transport(#[from] rumqttc::ClientError),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    /// Whether ingestion must stop rather than skip the message.
    ///
    /// Only storage failures qualify, and of those only the ones that are not a
    /// constraint violation scoped to the current row.
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::Storage(sqlx::Error::Database(db)) => !(db.is_unique_violation()
                || db.is_foreign_key_violation()
                || db.is_check_violation()),
            IngestError::Storage(sqlx::Error::RowNotFound)
            | IngestError::Storage(sqlx::Error::ColumnDecode { .. })
            | IngestError::Storage(sqlx::Error::Decode(_)) => false,
            IngestError::Storage(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;
