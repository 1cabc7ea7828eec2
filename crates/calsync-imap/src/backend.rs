use crate::error::ImapError;
use crate::folders::expand_folders;
use crate::source::{
    is_calendar_attachment, CalendarCandidate, FolderSelection, ImapSettings, MailAttachment,
    MailSource, SourceProgress,
};
use crate::source::extract_calendar_links;
use async_trait::async_trait;
use mailparse::{parse_mail, ParsedMail};
use std::time::Duration;
use tracing::{debug, info, warn};

/// IMAP-backed mailbox source. The `imap` crate is synchronous, so every
/// operation runs on the blocking pool and is bounded by the configured
/// client timeout.
#[derive(Debug, Default)]
pub struct ImapMailSource;

impl ImapMailSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    async fn fetch(
        &self,
        settings: &ImapSettings,
        folders: &[FolderSelection],
        progress: Option<SourceProgress>,
    ) -> Result<Vec<CalendarCandidate>, ImapError> {
        let timeout_secs = settings.effective_timeout_secs();
        let settings = settings.clone();
        let folders = folders.to_vec();

        let task = tokio::task::spawn_blocking(move || {
            fetch_candidates_blocking(&settings, &folders, progress)
        });
        match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
            Ok(joined) => {
                joined.map_err(|err| ImapError::Data(format!("fetch task failed: {err}")))?
            }
            Err(_) => Err(ImapError::Timeout(timeout_secs)),
        }
    }

    async fn delete_message(
        &self,
        settings: &ImapSettings,
        folder: &str,
        message_id: &str,
    ) -> Result<bool, ImapError> {
        let timeout_secs = settings.effective_timeout_secs();
        let settings = settings.clone();
        let folder = folder.to_string();
        let message_id = message_id.to_string();

        let task = tokio::task::spawn_blocking(move || {
            delete_message_blocking(&settings, &folder, &message_id)
        });
        match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
            Ok(joined) => {
                joined.map_err(|err| ImapError::Data(format!("delete task failed: {err}")))?
            }
            Err(_) => Err(ImapError::Timeout(timeout_secs)),
        }
    }
}

fn connect_session(settings: &ImapSettings) -> Result<imap::Session<imap::Connection>, ImapError> {
    debug!(
        "Opening IMAP connection to {} (Timeout: {}s)",
        settings.host,
        settings.effective_timeout_secs()
    );
    let client = imap::ClientBuilder::new(settings.host.as_str(), settings.effective_port())
        .connect()?;
    client
        .login(settings.username.clone(), settings.password.clone())
        .map_err(|err| ImapError::from(err.0))
}

fn fetch_candidates_blocking(
    settings: &ImapSettings,
    selections: &[FolderSelection],
    progress: Option<SourceProgress>,
) -> Result<Vec<CalendarCandidate>, ImapError> {
    let mut session = connect_session(settings)?;
    let names = session.list(None, Some("*"))?;
    let available: Vec<(Option<String>, String)> = names
        .iter()
        .map(|name| (name.delimiter().map(str::to_string), name.name().to_string()))
        .collect();

    let mut candidates = Vec::new();
    for folder_name in expand_folders(selections, &available) {
        info!("Scanning IMAP folder {folder_name}");
        if let Err(err) = session.select(&folder_name) {
            warn!("Konnte IMAP Ordner {folder_name} nicht öffnen: {err}");
            continue;
        }

        let uids = match session.uid_search("ALL") {
            Ok(uids) => uids,
            Err(err) => {
                warn!("UID search in {folder_name} failed: {err}");
                continue;
            }
        };
        if uids.is_empty() {
            debug!("No messages found in folder {folder_name}");
            continue;
        }
        if let Some(progress) = &progress {
            progress(0, uids.len() as u64);
        }

        let mut sorted: Vec<u32> = uids.into_iter().collect();
        sorted.sort_unstable();
        let sequence = sorted
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let fetches = session.uid_fetch(sequence, "(UID RFC822)")?;
        for fetched in fetches.iter() {
            let Some(body) = fetched.body() else {
                continue;
            };
            let message_id = fetched
                .uid
                .map(|uid| uid.to_string())
                .unwrap_or_else(|| fetched.message.to_string());

            match parse_mail(body) {
                Ok(parsed) => {
                    let mut attachments = Vec::new();
                    let mut links = Vec::new();
                    collect_calendar_parts(&parsed, &mut attachments, &mut links);

                    candidates.push(CalendarCandidate {
                        message_id,
                        subject: header_value(&parsed, "Subject")
                            .unwrap_or_else(|| "(no subject)".to_string()),
                        sender: header_value(&parsed, "From")
                            .unwrap_or_else(|| "unknown".to_string()),
                        folder: folder_name.clone(),
                        attachments,
                        links,
                    });
                }
                Err(err) => {
                    warn!("Skipping unparsable message {message_id} in {folder_name}: {err}");
                }
            }
            if let Some(progress) = &progress {
                progress(1, 0);
            }
        }
    }

    let _ = session.logout();
    Ok(candidates)
}

fn delete_message_blocking(
    settings: &ImapSettings,
    folder: &str,
    message_id: &str,
) -> Result<bool, ImapError> {
    let mut session = connect_session(settings)?;
    info!("Deleting IMAP message {message_id} from {folder}");
    session.select(folder)?;

    // The numeric UID is stable for most servers; fall back to a Message-ID
    // header search otherwise.
    let query = match message_id.parse::<u32>() {
        Ok(uid) => format!("UID {uid}"),
        Err(_) => format!("HEADER Message-ID {message_id}"),
    };
    let matches = session.uid_search(&query)?;
    if matches.is_empty() {
        warn!("Keine Nachricht {message_id} in Ordner {folder} gefunden");
        let _ = session.logout();
        return Ok(false);
    }

    let sequence = matches
        .into_iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",");
    session.uid_store(&sequence, "+FLAGS (\\Deleted)")?;
    session.expunge()?;
    let _ = session.logout();
    Ok(true)
}

fn collect_calendar_parts(
    mail: &ParsedMail<'_>,
    attachments: &mut Vec<MailAttachment>,
    links: &mut Vec<String>,
) {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        let filename = part_filename(mail);

        if is_calendar_attachment(&content_type, filename.as_deref()) {
            let payload = mail.get_body_raw().unwrap_or_default();
            let filename = filename.unwrap_or_else(|| {
                if content_type == "text/x-vcalendar" {
                    "calendar.vcs".to_string()
                } else {
                    "calendar.ics".to_string()
                }
            });
            attachments.push(MailAttachment {
                filename,
                content_type,
                payload,
            });
            return;
        }

        if content_type == "text/plain" {
            if let Ok(text) = mail.get_body() {
                links.extend(extract_calendar_links(&text));
            }
        }
        return;
    }

    for part in &mail.subparts {
        collect_calendar_parts(part, attachments, links);
    }
}

fn header_value(mail: &ParsedMail<'_>, key: &str) -> Option<String> {
    for header in mail.get_headers() {
        if header.get_key_ref().eq_ignore_ascii_case(key) {
            return Some(header.get_value());
        }
    }
    None
}

fn part_filename(mail: &ParsedMail<'_>) -> Option<String> {
    let disposition = header_value(mail, "Content-Disposition")
        .unwrap_or_default()
        .to_ascii_lowercase();
    disposition_filename(&disposition).or_else(|| mail.ctype.params.get("name").cloned())
}

fn disposition_filename(disposition: &str) -> Option<String> {
    let key = "filename=";
    let index = disposition.find(key)?;
    let raw = disposition[index + key.len()..].trim();

    if let Some(stripped) = raw.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }

    raw.split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_calendar_attachment_from_multipart_message() {
        let raw = concat!(
            "From: chef@example.com\r\n",
            "To: alex@example.com\r\n",
            "Subject: Einladung\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n",
            "\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Termin siehe Anhang: https://cal.example.com/invite.ics\r\n",
            "--XYZ\r\n",
            "Content-Type: text/calendar; charset=utf-8; method=REQUEST\r\n",
            "Content-Disposition: attachment; filename=\"invite.ics\"\r\n",
            "\r\n",
            "BEGIN:VCALENDAR\r\n",
            "BEGIN:VEVENT\r\n",
            "UID:u1\r\n",
            "END:VEVENT\r\n",
            "END:VCALENDAR\r\n",
            "--XYZ--\r\n",
        );

        let parsed = parse_mail(raw.as_bytes()).expect("message parses");
        let mut attachments = Vec::new();
        let mut links = Vec::new();
        collect_calendar_parts(&parsed, &mut attachments, &mut links);

        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "invite.ics");
        assert!(String::from_utf8_lossy(&attachments[0].payload).contains("UID:u1"));
        assert_eq!(links, vec!["https://cal.example.com/invite.ics".to_string()]);
    }

    #[test]
    fn disposition_filename_handles_quoted_and_bare_values() {
        assert_eq!(
            disposition_filename("attachment; filename=\"invite.ics\""),
            Some("invite.ics".to_string())
        );
        assert_eq!(
            disposition_filename("attachment; filename=invite.ics; size=42"),
            Some("invite.ics".to_string())
        );
        assert_eq!(disposition_filename("inline"), None);
    }
}
