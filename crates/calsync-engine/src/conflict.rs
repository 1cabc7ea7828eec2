use crate::engine::SyncEngine;
use crate::error::EngineError;
use calsync_caldav::{CalDavSettings, RemoteEventSummary};
use calsync_core::{
    ConflictDifference, ConflictResolutionOption, EventSnapshot, SyncConflictDetails, SyncState,
    TrackedEvent,
};
use calsync_ical::extract_event_snapshot;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::warn;

const DIFF_FIELDS: [(&str, &str); 6] = [
    ("summary", "Titel"),
    ("start", "Beginn"),
    ("end", "Ende"),
    ("organizer", "Organisator"),
    ("location", "Ort"),
    ("description", "Beschreibung"),
];

/// Field-by-field differences between the local event and the captured
/// remote snapshot, plus the static resolution suggestions.
pub fn conflict_details(event: &TrackedEvent) -> Option<SyncConflictDetails> {
    if !event.sync_conflict {
        return None;
    }

    let remote: EventSnapshot = event
        .sync_conflict_snapshot
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default();

    let mut local = EventSnapshot {
        uid: Some(event.uid.clone()),
        summary: event.summary.clone(),
        organizer: event.organizer.clone(),
        start: event.start.map(|value| value.to_rfc3339()),
        end: event.end.map(|value| value.to_rfc3339()),
        location: None,
        description: None,
        response_status: None,
    };
    if let Some(payload) = &event.payload {
        match extract_event_snapshot(payload, Some(&event.uid)) {
            Ok(snapshot) => {
                if snapshot.summary.is_some() {
                    local.summary = snapshot.summary;
                }
                if snapshot.organizer.is_some() {
                    local.organizer = snapshot.organizer;
                }
                if snapshot.start.is_some() {
                    local.start = snapshot.start;
                }
                if snapshot.end.is_some() {
                    local.end = snapshot.end;
                }
                local.location = snapshot.location;
                local.description = snapshot.description;
            }
            Err(err) => {
                warn!(
                    "Konfliktdetails konnten nicht aus lokaler Payload gelesen werden: {} ({err})",
                    event.uid
                );
            }
        }
    }

    let mut differences = Vec::new();
    for (field, label) in DIFF_FIELDS {
        let local_value = snapshot_field(&local, field);
        let remote_value = snapshot_field(&remote, field);
        if local_value.is_none() && remote_value.is_none() {
            continue;
        }
        if local_value == remote_value {
            continue;
        }
        differences.push(ConflictDifference {
            field: field.to_string(),
            label: label.to_string(),
            local_value,
            remote_value,
        });
    }

    Some(SyncConflictDetails {
        differences,
        suggestions: resolution_suggestions(),
    })
}

fn snapshot_field(snapshot: &EventSnapshot, field: &str) -> Option<String> {
    match field {
        "summary" => snapshot.summary.clone(),
        "organizer" => snapshot.organizer.clone(),
        "start" => snapshot.start.clone(),
        "end" => snapshot.end.clone(),
        "location" => snapshot.location.clone(),
        "description" => snapshot.description.clone(),
        _ => None,
    }
}

fn resolution_suggestions() -> Vec<ConflictResolutionOption> {
    vec![
        ConflictResolutionOption {
            action: "retry-sync".to_string(),
            label: "E-Mail-Import erneut synchronisieren".to_string(),
            description: "Prüfe die Daten aus dem E-Mail-Import und starte anschließend eine neue Synchronisation, sobald der Konflikt behoben ist.".to_string(),
            interactive: false,
            requires_confirmation: false,
        },
        ConflictResolutionOption {
            action: "apply-remote".to_string(),
            label: "Kalenderdaten übernehmen".to_string(),
            description: "Übernehme die Anpassungen aus den Kalenderdaten manuell oder importiere die ICS-Daten, um beide Stände anzugleichen.".to_string(),
            interactive: false,
            requires_confirmation: false,
        },
        ConflictResolutionOption {
            action: "disable-tracking".to_string(),
            label: "Termin nicht mehr verfolgen".to_string(),
            description: "Blendet den Termin dauerhaft in CalSync aus und stoppt die automatische Synchronisation.".to_string(),
            interactive: true,
            requires_confirmation: true,
        },
    ]
}

/// Synchronization metadata exposed alongside an event in API responses.
pub fn sync_state(event: &TrackedEvent) -> SyncState {
    SyncState {
        local_version: event.local_version,
        synced_version: event.synced_version,
        has_conflict: event.sync_conflict,
        conflict_reason: event.sync_conflict_reason.clone(),
        local_last_modified: event.local_last_modified,
        remote_last_modified: event.remote_last_modified,
        last_modified_source: event.last_modified_source,
        caldav_etag: event.caldav_etag.clone(),
        conflict_details: conflict_details(event),
    }
}

/// A safe search window around an event for overlap queries.
fn event_search_window(event: &TrackedEvent) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = event.start.or(event.end)?;
    let mut end = event.end.or(event.start).unwrap_or(start);
    if end <= start {
        end = start + Duration::minutes(30);
    }
    Some((start, end))
}

impl SyncEngine {
    /// Remote events overlapping each given event's time window, keyed by
    /// event id. Used for conflict visualization in listings.
    pub async fn calendar_overlaps(
        &self,
        events: &[TrackedEvent],
        calendar_url: &str,
        settings: &CalDavSettings,
    ) -> Result<HashMap<i64, Vec<RemoteEventSummary>>, EngineError> {
        let windows: Vec<(&TrackedEvent, DateTime<Utc>, DateTime<Utc>)> = events
            .iter()
            .filter_map(|event| {
                event_search_window(event).map(|(start, end)| (event, start, end))
            })
            .collect();
        if windows.is_empty() {
            return Ok(HashMap::new());
        }

        let overall_start = windows.iter().map(|(_, start, _)| *start).min().unwrap_or_else(Utc::now);
        let overall_end = windows.iter().map(|(_, _, end)| *end).max().unwrap_or_else(Utc::now);

        let candidates = self
            .caldav
            .search_overlapping(settings, calendar_url, overall_start, overall_end)
            .await?;

        let mut parsed: Vec<(RemoteEventSummary, DateTime<Utc>, DateTime<Utc>)> = Vec::new();
        for candidate in candidates {
            let (Some(start_raw), Some(end_raw)) = (&candidate.start, &candidate.end) else {
                warn!("Konflikt ohne gültige Zeitangaben übersprungen: {:?}", candidate.uid);
                continue;
            };
            let (Ok(start), Ok(end)) = (
                DateTime::parse_from_rfc3339(start_raw),
                DateTime::parse_from_rfc3339(end_raw),
            ) else {
                warn!("Konnte Konfliktzeiten nicht parsen: {:?}", candidate.uid);
                continue;
            };
            parsed.push((
                candidate,
                start.with_timezone(&Utc),
                end.with_timezone(&Utc),
            ));
        }

        let mut overlaps: HashMap<i64, Vec<RemoteEventSummary>> = HashMap::new();
        for (event, start, end) in windows {
            let mut conflicts = Vec::new();
            for (candidate, candidate_start, candidate_end) in &parsed {
                if candidate.uid.as_deref() == Some(event.uid.as_str()) {
                    continue;
                }
                if *candidate_start >= end || *candidate_end <= start {
                    continue;
                }
                conflicts.push(candidate.clone());
            }
            if !conflicts.is_empty() {
                overlaps.insert(event.id, conflicts);
            }
        }
        Ok(overlaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{engine_with_mock, sample_event, settings, MockCalDav};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn no_conflict_means_no_details() {
        assert!(conflict_details(&sample_event("u1")).is_none());
    }

    #[test]
    fn conflict_details_list_divergent_fields() {
        let mut event = sample_event("u1");
        event.sync_conflict = true;
        event.sync_conflict_reason = Some("extern geändert".to_string());
        event.sync_conflict_snapshot = Some(json!({
            "uid": "u1",
            "summary": "Kickoff (Kalender)",
            "organizer": "chef@example.com",
            "start": "2024-01-01T09:00:00+00:00",
            "end": "2024-01-01T10:00:00+00:00",
            "location": "Raum 5",
            "description": null,
            "response_status": null,
        }));

        let details = conflict_details(&event).expect("details");
        let fields: Vec<&str> = details
            .differences
            .iter()
            .map(|difference| difference.field.as_str())
            .collect();
        assert!(fields.contains(&"summary"));
        assert!(fields.contains(&"location"));
        assert!(!fields.contains(&"organizer"));
        assert_eq!(details.suggestions.len(), 3);
        assert!(details
            .suggestions
            .iter()
            .any(|option| option.action == "disable-tracking" && option.requires_confirmation));
    }

    #[test]
    fn sync_state_carries_the_reconciliation_counters() {
        let mut event = sample_event("u1");
        event.local_version = 3;
        event.synced_version = 2;
        event.caldav_etag = Some("\"v1\"".to_string());

        let state = sync_state(&event);
        assert_eq!(state.local_version, 3);
        assert_eq!(state.synced_version, 2);
        assert!(!state.has_conflict);
        assert_eq!(state.caldav_etag.as_deref(), Some("\"v1\""));
        assert!(state.conflict_details.is_none());
    }

    #[tokio::test]
    async fn calendar_overlaps_filter_same_uid_and_disjoint_windows() {
        let mock = Arc::new(MockCalDav::default());
        {
            let mut overlaps = mock.overlaps.lock().unwrap();
            overlaps.push(RemoteEventSummary {
                uid: Some("u1".to_string()),
                summary: Some("Selbst".to_string()),
                start: Some("2024-01-01T09:00:00+00:00".to_string()),
                end: Some("2024-01-01T10:00:00+00:00".to_string()),
            });
            overlaps.push(RemoteEventSummary {
                uid: Some("other".to_string()),
                summary: Some("Parallel".to_string()),
                start: Some("2024-01-01T09:30:00+00:00".to_string()),
                end: Some("2024-01-01T10:30:00+00:00".to_string()),
            });
            overlaps.push(RemoteEventSummary {
                uid: Some("later".to_string()),
                summary: Some("Danach".to_string()),
                start: Some("2024-01-01T12:00:00+00:00".to_string()),
                end: Some("2024-01-01T13:00:00+00:00".to_string()),
            });
        }
        let engine = engine_with_mock(mock).await;

        let mut event = sample_event("u1");
        event.start = Some(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        event.end = Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        let stored = engine.store().insert_event(&event).await.expect("insert");

        let overlaps = engine
            .calendar_overlaps(&[stored.clone()], "https://dav.example.com/cal", &settings())
            .await
            .expect("overlaps");

        let conflicts = overlaps.get(&stored.id).expect("entry");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].uid.as_deref(), Some("other"));
    }
}
