use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Mailbox,
    Calendar,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mailbox => "mailbox",
            Self::Calendar => "calendar",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mailbox" => Some(Self::Mailbox),
            "calendar" => Some(Self::Calendar),
            _ => None,
        }
    }
}

/// A configured mailbox or calendar endpoint. `settings` is an opaque JSON
/// blob whose sensitive fields are stored encrypted (`enc:` prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub label: String,
    pub kind: AccountKind,
    pub settings: serde_json::Value,
    pub folders: Vec<MailboxFolder>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A mailbox folder selected for scanning. Rebuilt whenever the owning
/// account is updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxFolder {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub include_subfolders: bool,
}

/// Pairs one mailbox folder with one target calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMapping {
    pub id: i64,
    pub mailbox_account_id: i64,
    pub mailbox_folder: String,
    pub calendar_account_id: i64,
    pub calendar_url: String,
    pub calendar_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    New,
    Updated,
    Cancelled,
    Synced,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Cancelled => "cancelled",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "updated" => Some(Self::Updated),
            "cancelled" => Some(Self::Cancelled),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    None,
    Accepted,
    Tentative,
    Declined,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Accepted => "accepted",
            Self::Tentative => "tentative",
            Self::Declined => "declined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "accepted" => Some(Self::Accepted),
            "tentative" => Some(Self::Tentative),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

impl Default for ResponseStatus {
    fn default() -> Self {
        Self::None
    }
}

/// Which side produced the most recent content mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModificationSource {
    Local,
    Remote,
}

impl ModificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// One append-only audit log entry on a tracked event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub action: String,
    pub description: String,
}

impl HistoryEntry {
    pub fn now(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            action: action.into(),
            description: description.into(),
        }
    }
}

/// The per-UID record bridging a mailbox-origin payload and its remote
/// calendar state. Never deleted by the engine; `tracking_disabled` and the
/// status field provide tombstone behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: i64,
    pub uid: String,
    pub mailbox_message_id: Option<String>,
    pub source_account_id: Option<i64>,
    pub source_folder: Option<String>,
    pub summary: Option<String>,
    pub organizer: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub response_status: ResponseStatus,
    pub cancelled_by_organizer: Option<bool>,
    pub payload: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
    pub caldav_etag: Option<String>,
    pub local_version: i64,
    pub synced_version: i64,
    pub remote_last_modified: Option<DateTime<Utc>>,
    pub local_last_modified: Option<DateTime<Utc>>,
    pub last_modified_source: Option<ModificationSource>,
    pub sync_conflict: bool,
    pub sync_conflict_reason: Option<String>,
    pub sync_conflict_snapshot: Option<serde_json::Value>,
    pub tracking_disabled: bool,
    pub mail_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedEvent {
    /// An event is pending export iff the local side moved past the last
    /// synchronized version.
    pub fn has_local_changes(&self) -> bool {
        self.local_version > self.synced_version
    }
}

/// Marks a mail import that must not re-mutate an event. `max_uid` is
/// persisted for a planned ingest filter and not consulted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoredMailImport {
    pub id: i64,
    pub uid: String,
    pub account_id: Option<i64>,
    pub folder: Option<String>,
    pub message_id: Option<String>,
    pub max_uid: Option<i64>,
}

/// Reduced view of a calendar payload used for diff rendering and conflict
/// snapshots. Datetimes are ISO-8601 in UTC.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSnapshot {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub organizer: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub response_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictDifference {
    pub field: String,
    pub label: String,
    pub local_value: Option<String>,
    pub remote_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolutionOption {
    pub action: String,
    pub label: String,
    pub description: String,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflictDetails {
    pub differences: Vec<ConflictDifference>,
    pub suggestions: Vec<ConflictResolutionOption>,
}

/// Synchronization metadata exposed alongside a tracked event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub local_version: i64,
    pub synced_version: i64,
    pub has_conflict: bool,
    pub conflict_reason: Option<String>,
    pub local_last_modified: Option<DateTime<Utc>>,
    pub remote_last_modified: Option<DateTime<Utc>>,
    pub last_modified_source: Option<ModificationSource>,
    pub caldav_etag: Option<String>,
    pub conflict_details: Option<SyncConflictDetails>,
}

/// Job status envelope returned for background jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    pub processed: u64,
    pub total: Option<u64>,
    pub detail: Option<serde_json::Value>,
    pub message: Option<String>,
}

/// One event a manual sync could not route, with the human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSyncMissingDetail {
    pub event_id: i64,
    pub uid: String,
    pub account_id: Option<i64>,
    pub folder: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualSyncOutcome {
    pub uploaded: Vec<String>,
    pub missing: Vec<ManualSyncMissingDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSyncSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub auto_response: ResponseStatus,
}

impl Default for AutoSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 5,
            auto_response: ResponseStatus::None,
        }
    }
}
