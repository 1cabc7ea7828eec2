use crate::engine::SyncEngine;
use crate::error::EngineError;
use calsync_caldav::CalDavSettings;
use calsync_core::{
    EventSnapshot, EventStatus, HistoryEntry, ModificationSource, ResponseStatus, TrackedEvent,
};
use calsync_ical::{
    embed_response_property, escape_ical_text, format_utc_datetime, set_vevent_property,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Which side wins a field during a merge resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeSide {
    Email,
    Calendar,
}

/// User-chosen resolution for a quarantined conflict.
#[derive(Debug, Clone)]
pub enum ConflictResolution {
    /// Push the local payload over the remote version.
    OverwriteCalendar,
    /// Keep the calendar as it is and discard the pending mail import.
    SkipEmailImport,
    /// Rebuild the payload field by field from the chosen sides, then push.
    MergeFields(BTreeMap<String, MergeSide>),
}

impl ConflictResolution {
    pub fn from_action(
        action: &str,
        selections: Option<BTreeMap<String, MergeSide>>,
    ) -> Option<Self> {
        match action {
            "overwrite-calendar" => Some(Self::OverwriteCalendar),
            "skip-email-import" => Some(Self::SkipEmailImport),
            "merge-fields" => Some(Self::MergeFields(selections.unwrap_or_default())),
            _ => None,
        }
    }
}

const MERGEABLE_FIELDS: [&str; 6] = [
    "summary",
    "organizer",
    "start",
    "end",
    "location",
    "description",
];

impl SyncEngine {
    /// Apply a user resolution to a conflicted event. Only targeted
    /// resolution operations may modify an event while it is quarantined.
    pub async fn resolve_conflict(
        &self,
        event_id: i64,
        resolution: ConflictResolution,
        calendar_url: &str,
        settings: &CalDavSettings,
    ) -> Result<TrackedEvent, EngineError> {
        let mut event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Termin {event_id} nicht gefunden")))?;
        if !event.sync_conflict {
            return Err(EngineError::InvalidAction(
                "Kein Synchronisationskonflikt für diesen Termin".to_string(),
            ));
        }

        match resolution {
            ConflictResolution::OverwriteCalendar => {
                self.force_overwrite(
                    &mut event,
                    calendar_url,
                    settings,
                    "Konflikt gelöst: Kalender überschrieben",
                )
                .await?;
            }
            ConflictResolution::SkipEmailImport => {
                clear_conflict(&mut event);
                event.synced_version = event.local_version;
                event.history.push(HistoryEntry::now(
                    "conflict-resolved",
                    "Konflikt gelöst: E-Mail-Import verworfen",
                ));
                self.store.update_event(&event).await?;
                info!("Discarded local version of {} without upload", event.uid);
            }
            ConflictResolution::MergeFields(selections) => {
                self.merge_fields(&mut event, &selections)?;
                self.force_overwrite(
                    &mut event,
                    calendar_url,
                    settings,
                    "Konflikt gelöst: Felder zusammengeführt",
                )
                .await?;
            }
        }

        self.store
            .get_event(event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Termin {event_id} nicht gefunden")))
    }

    /// Upload the local payload unconditionally and mark the event synced.
    async fn force_overwrite(
        &self,
        event: &mut TrackedEvent,
        calendar_url: &str,
        settings: &CalDavSettings,
        description: &str,
    ) -> Result<(), EngineError> {
        let payload = event
            .payload
            .clone()
            .ok_or_else(|| EngineError::Data(format!("event {} has no payload", event.uid)))?;

        let state = self
            .caldav
            .upload(settings, calendar_url, &event.uid, &payload)
            .await?;

        clear_conflict(event);
        event.status = EventStatus::Synced;
        event.synced_version = event.local_version;
        event.last_synced = Some(Utc::now());
        event.last_modified_source = Some(ModificationSource::Local);
        if let Some(state) = state {
            if state.etag.is_some() {
                event.caldav_etag = state.etag;
            }
            if state.last_modified.is_some() {
                event.remote_last_modified = state.last_modified;
            }
        }
        event
            .history
            .push(HistoryEntry::now("conflict-resolved", description));
        self.store.update_event(event).await?;
        info!("Resolved conflict for {} by overwrite", event.uid);
        Ok(())
    }

    /// Rebuild the local payload from the per-field selection map. Fields
    /// not named in the map keep the email side.
    fn merge_fields(
        &self,
        event: &mut TrackedEvent,
        selections: &BTreeMap<String, MergeSide>,
    ) -> Result<(), EngineError> {
        let remote: EventSnapshot = event
            .sync_conflict_snapshot
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();

        let mut payload = event
            .payload
            .clone()
            .ok_or_else(|| EngineError::Data(format!("event {} has no payload", event.uid)))?;

        for field in MERGEABLE_FIELDS {
            if selections.get(field).copied() != Some(MergeSide::Calendar) {
                continue;
            }
            match field {
                "summary" => {
                    event.summary = remote.summary.clone();
                    payload = set_vevent_property(
                        &payload,
                        "SUMMARY",
                        remote.summary.as_deref().map(escape_ical_text).as_deref(),
                    );
                }
                "organizer" => {
                    event.organizer = remote.organizer.clone();
                    let value = remote
                        .organizer
                        .as_deref()
                        .map(|address| format!("mailto:{address}"));
                    payload = set_vevent_property(&payload, "ORGANIZER", value.as_deref());
                }
                "start" => {
                    let parsed = parse_snapshot_datetime(remote.start.as_deref());
                    event.start = parsed;
                    payload = set_vevent_property(
                        &payload,
                        "DTSTART",
                        parsed.map(|value| format_utc_datetime(&value)).as_deref(),
                    );
                }
                "end" => {
                    let parsed = parse_snapshot_datetime(remote.end.as_deref());
                    event.end = parsed;
                    payload = set_vevent_property(
                        &payload,
                        "DTEND",
                        parsed.map(|value| format_utc_datetime(&value)).as_deref(),
                    );
                }
                "location" => {
                    payload = set_vevent_property(
                        &payload,
                        "LOCATION",
                        remote.location.as_deref().map(escape_ical_text).as_deref(),
                    );
                }
                "description" => {
                    payload = set_vevent_property(
                        &payload,
                        "DESCRIPTION",
                        remote
                            .description
                            .as_deref()
                            .map(escape_ical_text)
                            .as_deref(),
                    );
                }
                _ => {}
            }
        }

        event.payload = Some(payload);
        event.local_version += 1;
        event.local_last_modified = Some(Utc::now());
        event.last_modified_source = Some(ModificationSource::Local);
        Ok(())
    }

    /// Hide the event from all listings and sync paths.
    pub async fn disable_tracking(&self, event_id: i64) -> Result<TrackedEvent, EngineError> {
        let mut event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Termin {event_id} nicht gefunden")))?;

        if !event.tracking_disabled {
            event.tracking_disabled = true;
            event.sync_conflict = false;
            event.sync_conflict_reason = Some("Tracking deaktiviert".to_string());
            event.sync_conflict_snapshot = None;
            event.history.push(HistoryEntry::now(
                "tracking-disabled",
                "Tracking für diesen Termin wurde deaktiviert",
            ));
            self.store.update_event(&event).await?;
            info!("Tracking für Termin {} wurde deaktiviert", event.uid);
        }
        Ok(event)
    }

    /// Record the user's participation answer: bump the local version, stamp
    /// the payload property and clear any conflict state.
    pub async fn update_response(
        &self,
        event_id: i64,
        response: ResponseStatus,
    ) -> Result<TrackedEvent, EngineError> {
        let mut event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Termin {event_id} nicht gefunden")))?;

        event.response_status = response;
        if event.status != EventStatus::Cancelled {
            event.status = EventStatus::Updated;
        }
        if let Some(payload) = &event.payload {
            event.payload = Some(embed_response_property(payload, response));
        }
        let description = match response {
            ResponseStatus::Accepted => "Teilnahme zugesagt",
            ResponseStatus::Tentative => "Teilnahme auf vielleicht gesetzt",
            ResponseStatus::Declined => "Teilnahme abgesagt",
            ResponseStatus::None => "Antwort zurückgesetzt",
        };
        event.history.push(HistoryEntry::now("response", description));
        event.local_version += 1;
        event.local_last_modified = Some(Utc::now());
        event.last_modified_source = Some(ModificationSource::Local);
        clear_conflict(&mut event);
        self.store.update_event(&event).await?;
        info!(
            "Updated response for event {} to {}",
            event.uid,
            response.as_str()
        );
        Ok(event)
    }

    /// Auto-sync follow-up: flip a freshly uploaded event to accepted.
    pub async fn apply_auto_accept(&self, event_id: i64) -> Result<TrackedEvent, EngineError> {
        let mut event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Termin {event_id} nicht gefunden")))?;

        event.response_status = ResponseStatus::Accepted;
        if let Some(payload) = &event.payload {
            event.payload = Some(embed_response_property(payload, ResponseStatus::Accepted));
        }
        event.history.push(HistoryEntry::now(
            "response",
            "Automatisch zugesagt (AutoSync)",
        ));
        self.store.update_event(&event).await?;
        Ok(event)
    }
}

fn clear_conflict(event: &mut TrackedEvent) {
    event.sync_conflict = false;
    event.sync_conflict_reason = None;
    event.sync_conflict_snapshot = None;
}

fn parse_snapshot_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value?)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
