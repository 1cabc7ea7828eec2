use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("CALSYNC_SECRET_KEY ist nicht gesetzt. Verschlüsselung kann nicht durchgeführt werden.")]
    MissingSecretKey,
    #[error("Gespeichertes Geheimnis konnte nicht entschlüsselt werden.")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}
