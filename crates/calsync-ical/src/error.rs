use thiserror::Error;

#[derive(Debug, Error)]
pub enum IcalError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid data: {0}")]
    Data(String),
}
