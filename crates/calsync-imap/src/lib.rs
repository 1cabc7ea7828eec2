mod backend;
mod error;
mod folders;
mod source;

pub use backend::ImapMailSource;
pub use error::ImapError;
pub use folders::expand_folders;
pub use source::{
    default_client_timeout, extract_calendar_links, CalendarCandidate, FolderSelection,
    ImapSettings, MailAttachment, MailSource, SourceProgress,
};
