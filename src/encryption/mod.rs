//! Streaming AEAD encryption for snapshot payloads.

mod age;

pub use self::age::{validate_recipient, AgeEncryption};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("invalid age recipient public key: {0}")]
    InvalidRecipient(String),

    #[error("invalid age identity: {0}")]
    InvalidIdentity(String),

    #[error("recipient public key does not match identity")]
    RecipientMismatch,

    #[error("identity is not set; decryption requires an age identity")]
    IdentityNotSet,

    #[error("the stream is not encrypted to recipients")]
    UnexpectedFormat,

    #[error("failed to encrypt stream")]
    Encrypt(#[source] anyhow::Error),

    #[error("failed to decrypt stream")]
    Decrypt(#[source] anyhow::Error),
}

#[async_trait]
pub trait Encryption: Send + Sync {
    /// Wrap a destination in an encrypting writer. Shutting the writer down
    /// flushes the AEAD footer and then shuts down the destination.
    async fn encrypted_writer(
        &self,
        dst: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, EncryptionError>;

    /// Wrap a source in a decrypting reader.
    async fn decrypted_reader(
        &self,
        src: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, EncryptionError>;
}
