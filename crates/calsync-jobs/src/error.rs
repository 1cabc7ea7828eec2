use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] calsync_store::StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] calsync_engine::EngineError),
    #[error("imap error: {0}")]
    Imap(#[from] calsync_imap::ImapError),
    #[error("caldav error: {0}")]
    CalDav(#[from] calsync_caldav::CalDavError),
    #[error("crypto error: {0}")]
    Crypto(#[from] calsync_security::CryptoError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid data: {0}")]
    Data(String),
}
