use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] calsync_store::StoreError),
    #[error("caldav error: {0}")]
    CalDav(#[from] calsync_caldav::CalDavError),
    #[error("ical error: {0}")]
    Ical(#[from] calsync_ical::IcalError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidAction(String),
    #[error("invalid data: {0}")]
    Data(String),
}
