use crate::error::ImapError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 180;

const CALENDAR_MIME_TYPES: [&str; 2] = ["text/calendar", "text/x-vcalendar"];
const CALENDAR_EXTENSIONS: [&str; 2] = [".ics", ".vcs"];

/// Socket timeout in seconds, overridable via `IMAP_CLIENT_TIMEOUT`. Invalid
/// overrides fall back to the default with a warning.
pub fn default_client_timeout() -> u64 {
    let Ok(raw) = std::env::var("IMAP_CLIENT_TIMEOUT") else {
        return DEFAULT_CLIENT_TIMEOUT_SECS;
    };
    match raw.trim().parse::<u64>() {
        Ok(parsed) if parsed > 0 => parsed,
        _ => {
            warn!(
                "Ungültiger Wert für IMAP_CLIENT_TIMEOUT ({raw}), verwende {DEFAULT_CLIENT_TIMEOUT_SECS} Sekunden."
            );
            DEFAULT_CLIENT_TIMEOUT_SECS
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_ssl")]
    pub ssl: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_ssl() -> bool {
    true
}

impl ImapSettings {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.ssl { 993 } else { 143 })
    }

    pub fn effective_timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or_else(default_client_timeout)
    }
}

/// One folder the user selected for scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSelection {
    pub name: String,
    #[serde(default = "default_include_subfolders")]
    pub include_subfolders: bool,
}

fn default_include_subfolders() -> bool {
    true
}

impl FolderSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            include_subfolders: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// A message that may carry calendar data: its calendar parts plus any
/// calendar links found in plain-text bodies.
#[derive(Debug, Clone)]
pub struct CalendarCandidate {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub folder: String,
    pub attachments: Vec<MailAttachment>,
    pub links: Vec<String>,
}

/// Progress callback: (processed delta, total delta).
pub type SourceProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// The mailbox side of the bridge. The orchestrator only depends on this
/// contract; the IMAP backend is one implementation.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn fetch(
        &self,
        settings: &ImapSettings,
        folders: &[FolderSelection],
        progress: Option<SourceProgress>,
    ) -> Result<Vec<CalendarCandidate>, ImapError>;

    /// Remove a message by UID or Message-ID. Returns whether a message was
    /// found and deleted.
    async fn delete_message(
        &self,
        settings: &ImapSettings,
        folder: &str,
        message_id: &str,
    ) -> Result<bool, ImapError>;
}

/// Whether a mail part represents a calendar payload.
pub(crate) fn is_calendar_attachment(content_type: &str, filename: Option<&str>) -> bool {
    if CALENDAR_MIME_TYPES.contains(&content_type) {
        return true;
    }
    if let Some(filename) = filename {
        let lowered = filename.to_ascii_lowercase();
        return CALENDAR_EXTENSIONS
            .iter()
            .any(|extension| lowered.ends_with(extension));
    }
    false
}

/// Extract potential calendar links from plain text bodies.
pub fn extract_calendar_links(text: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"https?://\S+(?:/download/(?:ics|vcs)|\.(?:ics|vcs)\b)")
            .expect("valid calendar link regex")
    });
    let links: Vec<String> = re.find_iter(text).map(|m| m.as_str().to_string()).collect();
    debug!("Found {} calendar links", links.len());
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_calendar_parts_by_mime_type_and_suffix() {
        assert!(is_calendar_attachment("text/calendar", None));
        assert!(is_calendar_attachment("text/x-vcalendar", None));
        assert!(is_calendar_attachment("application/octet-stream", Some("invite.ICS")));
        assert!(is_calendar_attachment("application/octet-stream", Some("invite.vcs")));
        assert!(!is_calendar_attachment("text/plain", Some("notes.txt")));
        assert!(!is_calendar_attachment("application/octet-stream", None));
    }

    #[test]
    fn extracts_calendar_links_from_text() {
        let text = "Termin: https://cal.example.com/invite.ics und https://example.com/page plus https://cal.example.com/download/ics";
        let links = extract_calendar_links(text);
        assert_eq!(
            links,
            vec![
                "https://cal.example.com/invite.ics".to_string(),
                "https://cal.example.com/download/ics".to_string(),
            ]
        );
    }

    #[test]
    fn timeout_falls_back_on_invalid_override() {
        std::env::set_var("IMAP_CLIENT_TIMEOUT", "not-a-number");
        assert_eq!(default_client_timeout(), 180);
        std::env::set_var("IMAP_CLIENT_TIMEOUT", "0");
        assert_eq!(default_client_timeout(), 180);
        std::env::set_var("IMAP_CLIENT_TIMEOUT", "30");
        assert_eq!(default_client_timeout(), 30);
        std::env::remove_var("IMAP_CLIENT_TIMEOUT");
        assert_eq!(default_client_timeout(), 180);
    }
}
