use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImapError {
    #[error("imap protocol error: {0}")]
    Protocol(String),
    #[error("mail parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),
    #[error("invalid data: {0}")]
    Data(String),
}

impl From<imap::Error> for ImapError {
    fn from(error: imap::Error) -> Self {
        Self::Protocol(error.to_string())
    }
}
