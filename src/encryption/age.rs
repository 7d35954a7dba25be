//! age (X25519) encryption.
//!
//! Backups are encrypted to a single recipient public key persisted in the
//! manifest at init time. Decryption additionally needs the matching identity
//! file, supplied on restore.

use std::str::FromStr;

use age::x25519;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::{FuturesAsyncReadCompatExt, FuturesAsyncWriteCompatExt, TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

use crate::encryption::{Encryption, EncryptionError};
use crate::repository::AgeConfig;

pub struct AgeEncryption {
    recipient: x25519::Recipient,
    identity: Option<x25519::Identity>,
}

impl std::fmt::Debug for AgeEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgeEncryption").finish_non_exhaustive()
    }
}

impl AgeEncryption {
    /// Encrypt-only instance from the recipient persisted in the manifest.
    pub fn new(config: &AgeConfig) -> Result<Self, EncryptionError> {
        let recipient = parse_recipient(&config.recipient_public_key)?;
        Ok(Self {
            recipient,
            identity: None,
        })
    }

    /// Instance with decryption capability. The identity must match the
    /// recipient persisted in the manifest.
    pub fn with_identity(identity_content: &str, config: &AgeConfig) -> Result<Self, EncryptionError> {
        let identity = parse_identity(identity_content)?;
        let recipient = parse_recipient(&config.recipient_public_key)?;

        if identity.to_public().to_string() != recipient.to_string() {
            return Err(EncryptionError::RecipientMismatch);
        }

        Ok(Self {
            recipient,
            identity: Some(identity),
        })
    }
}

#[async_trait]
impl Encryption for AgeEncryption {
    async fn encrypted_writer(
        &self,
        dst: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, EncryptionError> {
        let recipient: Box<dyn age::Recipient + Send> = Box::new(self.recipient.clone());
        let encryptor = age::Encryptor::with_recipients(vec![recipient])
            .ok_or_else(|| EncryptionError::Encrypt(anyhow!("no recipients configured")))?;

        let writer = encryptor
            .wrap_async_output(dst.compat_write())
            .await
            .map_err(|err| EncryptionError::Encrypt(err.into()))?;

        Ok(Box::new(writer.compat_write()))
    }

    async fn decrypted_reader(
        &self,
        src: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, EncryptionError> {
        let identity = self.identity.as_ref().ok_or(EncryptionError::IdentityNotSet)?;

        let decryptor = match age::Decryptor::new_async(src.compat()).await {
            Ok(age::Decryptor::Recipients(decryptor)) => decryptor,
            Ok(_) => return Err(EncryptionError::UnexpectedFormat),
            Err(err) => return Err(EncryptionError::Decrypt(err.into())),
        };

        let reader = decryptor
            .decrypt_async(std::iter::once(identity as &dyn age::Identity))
            .map_err(|err| EncryptionError::Decrypt(err.into()))?;

        Ok(Box::new(reader.compat()))
    }
}

/// Check that a recipient public key parses; used by `init` before anything
/// is persisted.
pub fn validate_recipient(key: &str) -> Result<(), EncryptionError> {
    parse_recipient(key).map(|_| ())
}

fn parse_recipient(key: &str) -> Result<x25519::Recipient, EncryptionError> {
    x25519::Recipient::from_str(key.trim())
        .map_err(|err| EncryptionError::InvalidRecipient(err.to_string()))
}

/// Parse an identity file's content: comment lines starting with `#` are
/// skipped, the first remaining line must be the secret key.
fn parse_identity(content: &str) -> Result<x25519::Identity, EncryptionError> {
    let line = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| EncryptionError::InvalidIdentity("empty identity file".to_string()))?;

    x25519::Identity::from_str(line)
        .map_err(|err| EncryptionError::InvalidIdentity(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use age::secrecy::ExposeSecret;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn generated() -> (x25519::Identity, String) {
        let identity = x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        (identity, recipient)
    }

    #[test]
    fn test_validate_recipient_rejects_garbage() {
        assert!(validate_recipient("not-a-key").is_err());
    }

    #[test]
    fn test_validate_recipient_accepts_generated_key() {
        let (_, recipient) = generated();
        assert!(validate_recipient(&recipient).is_ok());
    }

    #[test]
    fn test_identity_must_match_recipient() {
        let (identity, _) = generated();
        let (_, other_recipient) = generated();

        let config = AgeConfig {
            recipient_public_key: other_recipient,
        };
        let err = AgeEncryption::with_identity(
            identity.to_string().expose_secret(),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, EncryptionError::RecipientMismatch));
    }

    #[test]
    fn test_identity_file_comments_are_skipped() {
        let (identity, recipient) = generated();
        let content = format!(
            "# created: 2026-01-01\n# public key: {recipient}\n{}\n",
            identity.to_string().expose_secret()
        );

        let config = AgeConfig {
            recipient_public_key: recipient,
        };
        assert!(AgeEncryption::with_identity(&content, &config).is_ok());
    }

    #[test]
    fn test_decryption_requires_identity() {
        let (_, recipient) = generated();
        let config = AgeConfig {
            recipient_public_key: recipient,
        };
        let encryption = AgeEncryption::new(&config).unwrap();
        assert!(encryption.identity.is_none());
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        let (identity, recipient) = generated();
        let config = AgeConfig {
            recipient_public_key: recipient,
        };
        let encryption =
            AgeEncryption::with_identity(identity.to_string().expose_secret(), &config)
                .unwrap();

        let plaintext = b"raw snapshot byte stream".to_vec();

        let (client, mut server) = tokio::io::duplex(1024 * 1024);
        {
            let mut writer = encryption.encrypted_writer(Box::new(client)).await.unwrap();
            writer.write_all(&plaintext).await.unwrap();
            writer.shutdown().await.unwrap();
        }
        let mut ciphertext = Vec::new();
        server.read_to_end(&mut ciphertext).await.unwrap();
        assert_ne!(ciphertext, plaintext);

        let mut reader = encryption
            .decrypted_reader(Box::new(std::io::Cursor::new(ciphertext)))
            .await
            .unwrap();
        let mut decrypted = Vec::new();
        reader.read_to_end(&mut decrypted).await.unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
