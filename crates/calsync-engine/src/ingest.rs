use crate::engine::SyncEngine;
use crate::error::EngineError;
use calsync_core::{
    EventStatus, HistoryEntry, ModificationSource, ResponseStatus, TrackedEvent,
};
use calsync_ical::{embed_response_property, set_vevent_property, unfold_lines, ParsedEvent};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

impl SyncEngine {
    /// Insert new or update existing tracked events from parsed ICS data.
    ///
    /// Content changes bump the local version and clear any conflict state;
    /// source metadata updates happen silently. Re-ingesting an identical
    /// payload leaves version, status and history untouched.
    pub async fn upsert_events(
        &self,
        parsed_events: &[ParsedEvent],
        source_message_id: &str,
        source_account_id: Option<i64>,
        source_folder: Option<&str>,
    ) -> Result<Vec<TrackedEvent>, EngineError> {
        let mut stored_events = Vec::with_capacity(parsed_events.len());

        for parsed in parsed_events {
            let cancelled_by_organizer = (parsed.status == EventStatus::Cancelled)
                .then(|| parsed.method.as_deref() == Some("CANCEL"));

            let mut description = format!("Event processed from message {source_message_id}");
            if let Some(response) = parsed.response_status {
                description.push_str(&format!(" · Antwort: {}", response.as_str()));
            }
            let history_entry = HistoryEntry::now(parsed.status.as_str(), description);

            let stored = match self.store.find_event_by_uid(&parsed.uid).await? {
                None => {
                    self.insert_new_event(parsed, cancelled_by_organizer, history_entry, source_message_id, source_account_id, source_folder)
                        .await?
                }
                Some(existing) => {
                    self.apply_parsed_update(
                        existing,
                        parsed,
                        cancelled_by_organizer,
                        history_entry,
                        source_message_id,
                        source_account_id,
                        source_folder,
                    )
                    .await?
                }
            };
            stored_events.push(stored);
        }

        Ok(stored_events)
    }

    async fn insert_new_event(
        &self,
        parsed: &ParsedEvent,
        cancelled_by_organizer: Option<bool>,
        history_entry: HistoryEntry,
        source_message_id: &str,
        source_account_id: Option<i64>,
        source_folder: Option<&str>,
    ) -> Result<TrackedEvent, EngineError> {
        let now = Utc::now();
        let response_status = parsed.response_status.unwrap_or(ResponseStatus::None);
        let mut payload = parsed.raw.clone();
        if parsed.response_status.is_some() {
            payload = embed_response_property(&payload, response_status);
        }

        let event = TrackedEvent {
            id: 0,
            uid: parsed.uid.clone(),
            mailbox_message_id: Some(source_message_id.to_string()),
            source_account_id,
            source_folder: source_folder.map(str::to_string),
            summary: parsed.summary.clone(),
            organizer: parsed.organizer.clone(),
            start: parsed.start,
            end: parsed.end,
            status: parsed.status,
            response_status,
            cancelled_by_organizer,
            payload: Some(payload),
            last_synced: None,
            history: vec![history_entry],
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
        };

        let stored = self.store.insert_event(&event).await?;
        info!("Stored new event {}", parsed.uid);
        Ok(stored)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_parsed_update(
        &self,
        mut event: TrackedEvent,
        parsed: &ParsedEvent,
        cancelled_by_organizer: Option<bool>,
        history_entry: HistoryEntry,
        source_message_id: &str,
        source_account_id: Option<i64>,
        source_folder: Option<&str>,
    ) -> Result<TrackedEvent, EngineError> {
        let previous_status = event.status;
        let mut content_changed = false;
        let mut metadata_changed = false;
        let mut response_changed = false;

        diff_field(&mut event.summary, parsed.summary.clone(), &mut content_changed);
        diff_field(&mut event.organizer, parsed.organizer.clone(), &mut content_changed);
        diff_datetime(&mut event.start, parsed.start, &mut content_changed);
        diff_datetime(&mut event.end, parsed.end, &mut content_changed);

        if !payloads_equivalent(event.payload.as_deref(), &parsed.raw) {
            let mut payload = parsed.raw.clone();
            if event.response_status != ResponseStatus::None {
                payload = embed_response_property(&payload, event.response_status);
            }
            event.payload = Some(payload);
            content_changed = true;
        }

        let reopened =
            previous_status == EventStatus::Cancelled && parsed.status != EventStatus::Cancelled;
        if reopened {
            content_changed = true;
        }

        if parsed.status == EventStatus::Cancelled {
            diff_field(
                &mut event.cancelled_by_organizer,
                cancelled_by_organizer,
                &mut content_changed,
            );
        } else {
            diff_field(&mut event.cancelled_by_organizer, None, &mut content_changed);
        }

        if source_account_id.is_some() {
            diff_field(
                &mut event.source_account_id,
                source_account_id,
                &mut metadata_changed,
            );
        }
        if let Some(folder) = source_folder {
            diff_field(
                &mut event.source_folder,
                Some(folder.to_string()),
                &mut metadata_changed,
            );
        }
        diff_field(
            &mut event.mailbox_message_id,
            Some(source_message_id.to_string()),
            &mut metadata_changed,
        );

        if let Some(response) = parsed.response_status {
            if response != event.response_status {
                event.response_status = response;
                if let Some(payload) = &event.payload {
                    event.payload = Some(embed_response_property(payload, response));
                }
                content_changed = true;
                response_changed = true;
            }
        }

        let mut status_changed = false;
        if parsed.status == EventStatus::Cancelled {
            if event.status != EventStatus::Cancelled {
                event.status = EventStatus::Cancelled;
                status_changed = true;
            }
        } else if content_changed && event.status != EventStatus::Updated {
            event.status = EventStatus::Updated;
            status_changed = true;
        }

        if content_changed || status_changed || response_changed {
            event.history.push(history_entry);
            event.local_version += 1;
            event.local_last_modified = Some(Utc::now());
            event.last_modified_source = Some(ModificationSource::Local);
            event.sync_conflict = false;
            event.sync_conflict_reason = None;
            event.sync_conflict_snapshot = None;
        }

        if content_changed || metadata_changed || status_changed || response_changed {
            self.store.update_event(&event).await?;
        }

        if content_changed || status_changed || response_changed {
            info!("Updated event {}", parsed.uid);
        } else if metadata_changed {
            debug!(
                "Updated metadata for event {} without content changes",
                parsed.uid
            );
        } else {
            debug!("No changes detected for event {}", parsed.uid);
        }

        Ok(self
            .store
            .get_event(event.id)
            .await?
            .unwrap_or(event))
    }
}

fn diff_field<T: PartialEq>(current: &mut T, new_value: T, changed: &mut bool) {
    if *current != new_value {
        *current = new_value;
        *changed = true;
    }
}

fn diff_datetime(
    current: &mut Option<DateTime<Utc>>,
    new_value: Option<DateTime<Utc>>,
    changed: &mut bool,
) {
    // Both sides are UTC-normalized at the decoder boundary already.
    if *current != new_value {
        *current = new_value;
        *changed = true;
    }
}

/// Payload equality modulo the locally embedded response property and line
/// folding, so a re-scan of identical mail never counts as a content change.
fn payloads_equivalent(stored: Option<&str>, incoming: &str) -> bool {
    let Some(stored) = stored else {
        return false;
    };
    normalized_payload(stored) == normalized_payload(incoming)
}

fn normalized_payload(payload: &str) -> Vec<String> {
    unfold_lines(&set_vevent_property(payload, "X-CALSYNC-RESPONSE", None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{engine_with_mock, MockCalDav};
    use calsync_ical::parse_ics_payload;
    use std::sync::Arc;

    fn request_ics(uid: &str, summary: &str, dtend: &str) -> String {
        [
            "BEGIN:VCALENDAR",
            "VERSION:2.0",
            "METHOD:REQUEST",
            "BEGIN:VEVENT",
            &format!("UID:{uid}"),
            &format!("SUMMARY:{summary}"),
            "ORGANIZER:mailto:chef@example.com",
            "DTSTART:20240101T090000Z",
            &format!("DTEND:{dtend}"),
            "END:VEVENT",
            "END:VCALENDAR",
            "",
        ]
        .join("\r\n")
    }

    fn cancel_ics(uid: &str, method: &str) -> String {
        [
            "BEGIN:VCALENDAR",
            "VERSION:2.0",
            &format!("METHOD:{method}"),
            "BEGIN:VEVENT",
            &format!("UID:{uid}"),
            "SUMMARY:Kickoff",
            "STATUS:CANCELLED",
            "DTSTART:20240101T090000Z",
            "DTEND:20240101T100000Z",
            "END:VEVENT",
            "END:VCALENDAR",
            "",
        ]
        .join("\r\n")
    }

    #[tokio::test]
    async fn fresh_import_creates_a_new_event() {
        let engine = engine_with_mock(Arc::new(MockCalDav::default())).await;
        let decoded =
            parse_ics_payload(request_ics("u1", "Kickoff", "20240101T100000Z").as_bytes())
                .expect("decoded");

        let stored = engine
            .upsert_events(&decoded.events, "msg-1", Some(1), Some("INBOX"))
            .await
            .expect("upsert");

        assert_eq!(stored.len(), 1);
        let event = &stored[0];
        assert_eq!(event.status, EventStatus::New);
        assert_eq!(event.local_version, 1);
        assert_eq!(event.synced_version, 0);
        assert_eq!(event.history.len(), 1);
        assert_eq!(event.history[0].action, "new");
        assert!(event.history[0]
            .description
            .contains("Event processed from message msg-1"));
        assert_eq!(event.last_modified_source, Some(ModificationSource::Local));
    }

    #[tokio::test]
    async fn identical_reimport_is_idempotent() {
        let engine = engine_with_mock(Arc::new(MockCalDav::default())).await;
        let decoded =
            parse_ics_payload(request_ics("u1", "Kickoff", "20240101T100000Z").as_bytes())
                .expect("decoded");

        engine
            .upsert_events(&decoded.events, "msg-1", Some(1), Some("INBOX"))
            .await
            .expect("first upsert");
        let second = engine
            .upsert_events(&decoded.events, "msg-2", Some(1), Some("INBOX"))
            .await
            .expect("second upsert");

        let event = &second[0];
        assert_eq!(event.local_version, 1);
        assert_eq!(event.history.len(), 1);
        assert_eq!(event.status, EventStatus::New);
        // The message id moves silently with the newest import.
        assert_eq!(event.mailbox_message_id.as_deref(), Some("msg-2"));
    }

    #[tokio::test]
    async fn field_change_bumps_version_and_clears_conflicts() {
        let engine = engine_with_mock(Arc::new(MockCalDav::default())).await;
        let initial =
            parse_ics_payload(request_ics("u1", "Kickoff", "20240101T100000Z").as_bytes())
                .expect("decoded");
        let stored = engine
            .upsert_events(&initial.events, "msg-1", Some(1), Some("INBOX"))
            .await
            .expect("upsert")
            .remove(0);

        // Simulate a previously recorded conflict.
        let mut conflicted = stored.clone();
        conflicted.sync_conflict = true;
        conflicted.sync_conflict_reason = Some("Kalendereintrag wurde extern geändert".to_string());
        engine.store().update_event(&conflicted).await.expect("seed conflict");

        let update = parse_ics_payload(request_ics("u1", "Kickoff", "20240101T110000Z").as_bytes())
            .expect("decoded");
        let updated = engine
            .upsert_events(&update.events, "msg-3", Some(1), Some("INBOX"))
            .await
            .expect("upsert")
            .remove(0);

        assert_eq!(updated.status, EventStatus::Updated);
        assert_eq!(updated.local_version, 2);
        assert_eq!(updated.history.len(), 2);
        assert!(!updated.sync_conflict);
        assert_eq!(updated.sync_conflict_reason, None);
    }

    #[tokio::test]
    async fn attendee_cancellation_is_attributed() {
        let engine = engine_with_mock(Arc::new(MockCalDav::default())).await;
        let decoded = parse_ics_payload(cancel_ics("u1", "REQUEST").as_bytes()).expect("decoded");
        let stored = engine
            .upsert_events(&decoded.events, "msg-1", Some(1), Some("INBOX"))
            .await
            .expect("upsert")
            .remove(0);

        assert_eq!(stored.status, EventStatus::Cancelled);
        assert_eq!(stored.cancelled_by_organizer, Some(false));
    }

    #[tokio::test]
    async fn organizer_cancellation_is_attributed() {
        let engine = engine_with_mock(Arc::new(MockCalDav::default())).await;
        let request =
            parse_ics_payload(request_ics("u1", "Kickoff", "20240101T100000Z").as_bytes())
                .expect("decoded");
        engine
            .upsert_events(&request.events, "msg-1", Some(1), Some("INBOX"))
            .await
            .expect("upsert");

        let cancel = parse_ics_payload(cancel_ics("u1", "CANCEL").as_bytes()).expect("decoded");
        let stored = engine
            .upsert_events(&cancel.events, "msg-2", Some(1), Some("INBOX"))
            .await
            .expect("upsert")
            .remove(0);

        assert_eq!(stored.status, EventStatus::Cancelled);
        assert_eq!(stored.cancelled_by_organizer, Some(true));
        assert_eq!(stored.local_version, 2);
    }

    #[tokio::test]
    async fn reopening_a_cancelled_event_marks_it_updated() {
        let engine = engine_with_mock(Arc::new(MockCalDav::default())).await;
        let cancel = parse_ics_payload(cancel_ics("u1", "CANCEL").as_bytes()).expect("decoded");
        engine
            .upsert_events(&cancel.events, "msg-1", Some(1), Some("INBOX"))
            .await
            .expect("upsert");

        let reopened =
            parse_ics_payload(request_ics("u1", "Kickoff", "20240101T100000Z").as_bytes())
                .expect("decoded");
        let stored = engine
            .upsert_events(&reopened.events, "msg-2", Some(1), Some("INBOX"))
            .await
            .expect("upsert")
            .remove(0);

        assert_eq!(stored.status, EventStatus::Updated);
        assert_eq!(stored.cancelled_by_organizer, None);
    }

    #[tokio::test]
    async fn reply_updates_response_status_and_payload() {
        let engine = engine_with_mock(Arc::new(MockCalDav::default())).await;
        let request =
            parse_ics_payload(request_ics("u1", "Kickoff", "20240101T100000Z").as_bytes())
                .expect("decoded");
        engine
            .upsert_events(&request.events, "msg-1", Some(1), Some("INBOX"))
            .await
            .expect("upsert");

        let reply = [
            "BEGIN:VCALENDAR",
            "VERSION:2.0",
            "METHOD:REPLY",
            "BEGIN:VEVENT",
            "UID:u1",
            "SUMMARY:Kickoff",
            "DTSTART:20240101T090000Z",
            "DTEND:20240101T100000Z",
            "ATTENDEE;PARTSTAT=ACCEPTED:mailto:alex@example.com",
            "END:VEVENT",
            "END:VCALENDAR",
            "",
        ]
        .join("\r\n");
        let decoded = parse_ics_payload(reply.as_bytes()).expect("decoded");
        let stored = engine
            .upsert_events(&decoded.events, "msg-2", Some(1), Some("INBOX"))
            .await
            .expect("upsert")
            .remove(0);

        assert_eq!(stored.response_status, ResponseStatus::Accepted);
        assert!(stored
            .payload
            .as_deref()
            .expect("payload")
            .contains("X-CALSYNC-RESPONSE:ACCEPTED"));
        assert!(stored
            .history
            .last()
            .expect("entry")
            .description
            .contains("Antwort: accepted"));
    }
}
