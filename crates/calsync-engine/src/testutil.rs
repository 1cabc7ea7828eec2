use crate::engine::SyncEngine;
use async_trait::async_trait;
use calsync_caldav::{
    CalDav, CalDavError, CalDavSettings, CalendarInfo, RemoteEventState, RemoteEventSummary,
};
use calsync_core::{AccountKind, EventStatus, ModificationSource, ResponseStatus, TrackedEvent};
use calsync_store::{NewAccount, Store};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) fn sample_event(uid: &str) -> TrackedEvent {
    let now = Utc::now();
    TrackedEvent {
        id: 0,
        uid: uid.to_string(),
        mailbox_message_id: Some("42".to_string()),
        source_account_id: Some(1),
        source_folder: Some("INBOX".to_string()),
        summary: Some("Kickoff".to_string()),
        organizer: Some("chef@example.com".to_string()),
        start: None,
        end: None,
        status: EventStatus::New,
        response_status: ResponseStatus::None,
        cancelled_by_organizer: None,
        payload: Some(simple_payload(uid, "Kickoff")),
        last_synced: None,
        history: Vec::new(),
        caldav_etag: None,
        local_version: 1,
        synced_version: 0,
        remote_last_modified: None,
        local_last_modified: Some(now),
        last_modified_source: Some(ModificationSource::Local),
        sync_conflict: false,
        sync_conflict_reason: None,
        sync_conflict_snapshot: None,
        tracking_disabled: false,
        mail_error: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn simple_payload(uid: &str, summary: &str) -> String {
    [
        "BEGIN:VCALENDAR",
        "VERSION:2.0",
        "BEGIN:VEVENT",
        &format!("UID:{uid}"),
        &format!("SUMMARY:{summary}"),
        "DTSTART:20240101T090000Z",
        "DTEND:20240101T100000Z",
        "END:VEVENT",
        "END:VCALENDAR",
        "",
    ]
    .join("\r\n")
}

pub(crate) fn settings() -> CalDavSettings {
    CalDavSettings {
        url: "https://dav.example.com".to_string(),
        username: Some("user".to_string()),
        password: Some("secret".to_string()),
    }
}

/// Scripted CalDAV double recording every call the engine makes.
#[derive(Default)]
pub(crate) struct MockCalDav {
    pub remote_states: Mutex<HashMap<String, RemoteEventState>>,
    pub uploads: Mutex<Vec<(String, String)>>,
    pub deletes: Mutex<Vec<String>>,
    pub overlaps: Mutex<Vec<RemoteEventSummary>>,
    pub fail_uploads: AtomicBool,
    pub fail_probes: AtomicBool,
}

impl MockCalDav {
    pub fn with_remote(uid: &str, state: RemoteEventState) -> Arc<Self> {
        let mock = Self::default();
        mock.remote_states
            .lock()
            .unwrap()
            .insert(uid.to_string(), state);
        Arc::new(mock)
    }

    pub fn uploaded_uids(&self) -> Vec<String> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(uid, _)| uid.clone())
            .collect()
    }
}

#[async_trait]
impl CalDav for MockCalDav {
    async fn upload(
        &self,
        _settings: &CalDavSettings,
        _calendar_url: &str,
        uid: &str,
        ical: &str,
    ) -> Result<Option<RemoteEventState>, CalDavError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(CalDavError::Status(
                "CalDAV upload failed with status 503".to_string(),
            ));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((uid.to_string(), ical.to_string()));
        Ok(Some(RemoteEventState {
            uid: uid.to_string(),
            etag: Some(format!("\"etag-{uid}\"")),
            last_modified: Some(Utc::now()),
            payload: None,
        }))
    }

    async fn delete_by_uid(
        &self,
        _settings: &CalDavSettings,
        _calendar_url: &str,
        uid: &str,
    ) -> Result<bool, CalDavError> {
        self.deletes.lock().unwrap().push(uid.to_string());
        Ok(self.remote_states.lock().unwrap().remove(uid).is_some())
    }

    async fn get_event_state(
        &self,
        _settings: &CalDavSettings,
        _calendar_url: &str,
        uid: &str,
    ) -> Result<Option<RemoteEventState>, CalDavError> {
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(CalDavError::Status(
                "CalDAV REPORT failed with status 500".to_string(),
            ));
        }
        Ok(self.remote_states.lock().unwrap().get(uid).cloned())
    }

    async fn search_overlapping(
        &self,
        _settings: &CalDavSettings,
        _calendar_url: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<RemoteEventSummary>, CalDavError> {
        Ok(self.overlaps.lock().unwrap().clone())
    }

    async fn list_calendars(
        &self,
        _settings: &CalDavSettings,
    ) -> Result<Vec<CalendarInfo>, CalDavError> {
        Ok(vec![CalendarInfo {
            url: "https://dav.example.com/cal".to_string(),
            name: "Arbeit".to_string(),
        }])
    }
}

pub(crate) async fn engine_with_mock(mock: Arc<MockCalDav>) -> SyncEngine {
    let store = Store::connect_in_memory().await.expect("store");
    store.initialize().await.expect("schema");
    store
        .create_account(&NewAccount {
            label: "Test Mailbox".to_string(),
            kind: AccountKind::Mailbox,
            settings: serde_json::json!({}),
            folders: Vec::new(),
        })
        .await
        .expect("account");
    SyncEngine::new(store, mock)
}
