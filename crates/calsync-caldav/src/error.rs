use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalDavError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid data: {0}")]
    Data(String),
}
