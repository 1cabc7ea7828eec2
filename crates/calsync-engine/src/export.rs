use crate::decision::{decide, Decision, SkipReason};
use crate::engine::SyncEngine;
use crate::error::EngineError;
use calsync_caldav::{CalDavSettings, RemoteEventState};
use calsync_core::{EventStatus, HistoryEntry, ModificationSource, TrackedEvent};
use calsync_ical::{extract_event_snapshot, parse_ics_payload, set_vevent_property};
use chrono::Utc;
use tracing::{info, warn};

/// Per-event progress callback: fires once per event, in input order, with a
/// success flag.
pub type ProgressFn<'a> = &'a (dyn Fn(&TrackedEvent, bool) + Send + Sync);

impl SyncEngine {
    /// Reconcile a batch of events against one calendar.
    ///
    /// Returns the UIDs that were uploaded as regular event payloads;
    /// cancellations and fast-forwards are reflected in the store but not in
    /// the returned list.
    pub async fn sync_events_to_calendar(
        &self,
        events: &[TrackedEvent],
        calendar_url: &str,
        settings: &CalDavSettings,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<String>, EngineError> {
        let mut uploaded: Vec<String> = Vec::new();
        let mut cancellations_processed = false;

        for event in events {
            // Work on the freshest row; callers may hold stale copies.
            let Some(mut current) = self.store.get_event(event.id).await? else {
                continue;
            };

            let remote = match self
                .caldav
                .get_event_state(settings, calendar_url, &current.uid)
                .await
            {
                Ok(state) => state,
                Err(err) => {
                    // A failed probe never blocks the export; without remote
                    // info no divergence can be detected.
                    warn!("Remote probe for {} failed: {err}", current.uid);
                    None
                }
            };

            let success = match decide(&current, remote.as_ref()) {
                Decision::RecordConflict { reason } => {
                    self.record_conflict(&mut current, remote.as_ref(), reason)
                        .await?;
                    false
                }
                Decision::FastForward => match remote.as_ref() {
                    Some(state) => match self.apply_remote(&mut current, state).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!("Fast-forward for {} failed: {err}", current.uid);
                            false
                        }
                    },
                    None => false,
                },
                Decision::Skip {
                    reason: SkipReason::AttendeeCancellation,
                } => {
                    info!(
                        "Skipping calendar removal for {} because cancellation was not initiated by the organizer",
                        current.uid
                    );
                    self.mark_cancellation_ignored(&mut current).await?;
                    cancellations_processed = true;
                    true
                }
                Decision::Skip {
                    reason: SkipReason::RemoteCancellation,
                } => {
                    cancellations_processed = true;
                    true
                }
                Decision::Cancel { legacy_attribution } => {
                    if legacy_attribution {
                        info!(
                            "Cancellation for {} has no attribution, treating as organizer-initiated",
                            current.uid
                        );
                    }
                    cancellations_processed = true;
                    self.push_cancellation(&mut current, calendar_url, settings)
                        .await?
                }
                Decision::Upload => match self
                    .upload_event(&mut current, calendar_url, settings)
                    .await
                {
                    Ok(()) => {
                        uploaded.push(current.uid.clone());
                        true
                    }
                    Err(err) => {
                        warn!("Failed to upload event {}: {err}", current.uid);
                        self.mark_upload_failed(&mut current, &err).await?;
                        false
                    }
                },
            };

            if let Some(progress) = progress {
                progress(&current, success);
            }
        }

        if uploaded.is_empty() && !cancellations_processed && !events.is_empty() {
            warn!("No events could be synced to {calendar_url}");
        }
        Ok(uploaded)
    }

    async fn upload_event(
        &self,
        event: &mut TrackedEvent,
        calendar_url: &str,
        settings: &CalDavSettings,
    ) -> Result<(), EngineError> {
        let payload = event
            .payload
            .clone()
            .ok_or_else(|| EngineError::Data(format!("event {} has no payload", event.uid)))?;

        let state = self
            .caldav
            .upload(settings, calendar_url, &event.uid, &payload)
            .await?;

        event.status = EventStatus::Synced;
        event.synced_version = event.local_version;
        event.last_synced = Some(Utc::now());
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
            .push(HistoryEntry::now("synced", "Event exported to CalDAV"));
        self.store.update_event(event).await?;
        Ok(())
    }

    async fn mark_upload_failed(
        &self,
        event: &mut TrackedEvent,
        error: &EngineError,
    ) -> Result<(), EngineError> {
        event.status = EventStatus::Failed;
        event.history.push(HistoryEntry::now(
            "failed",
            format!("Übertragung zum Kalender fehlgeschlagen: {error}"),
        ));
        self.store.update_event(event).await?;
        Ok(())
    }

    /// Push a cancellation: prefer a STATUS:CANCELLED upload so the calendar
    /// keeps its audit trail, delete only when no payload is stored.
    async fn push_cancellation(
        &self,
        event: &mut TrackedEvent,
        calendar_url: &str,
        settings: &CalDavSettings,
    ) -> Result<bool, EngineError> {
        let now = Utc::now();

        if let Some(payload) = event.payload.clone() {
            let payload = set_vevent_property(&payload, "STATUS", Some("CANCELLED"));
            match self
                .caldav
                .upload(settings, calendar_url, &event.uid, &payload)
                .await
            {
                Ok(state) => {
                    event.status = EventStatus::Cancelled;
                    event.synced_version = event.local_version;
                    event.last_synced = Some(now);
                    if let Some(state) = state {
                        if state.etag.is_some() {
                            event.caldav_etag = state.etag;
                        }
                        if state.last_modified.is_some() {
                            event.remote_last_modified = state.last_modified;
                        }
                    }
                    event.history.push(HistoryEntry::now(
                        "cancelled",
                        "Kalendereintrag als abgesagt markiert",
                    ));
                    self.store.update_event(event).await?;
                    Ok(true)
                }
                Err(err) => {
                    warn!("Failed to push cancellation for {}: {err}", event.uid);
                    event.history.push(HistoryEntry::now(
                        "cancelled",
                        format!("Absage konnte nicht übertragen werden: {err}"),
                    ));
                    self.store.update_event(event).await?;
                    Ok(false)
                }
            }
        } else {
            let removed = match self
                .caldav
                .delete_by_uid(settings, calendar_url, &event.uid)
                .await
            {
                Ok(removed) => removed,
                Err(err) => {
                    warn!("Failed to delete event {}: {err}", event.uid);
                    false
                }
            };
            let description = if removed {
                "Termin im Kalender entfernt"
            } else {
                "Kein Kalendereintrag zum Entfernen gefunden"
            };
            event.status = EventStatus::Cancelled;
            event.synced_version = event.local_version;
            event.last_synced = Some(now);
            event.history.push(HistoryEntry::now("cancelled", description));
            self.store.update_event(event).await?;
            Ok(removed)
        }
    }

    async fn mark_cancellation_ignored(
        &self,
        event: &mut TrackedEvent,
    ) -> Result<(), EngineError> {
        event.last_synced = Some(Utc::now());
        event.synced_version = event.local_version;
        event.history.push(HistoryEntry::now(
            "cancelled",
            "Absage ignoriert (nicht vom Ersteller)",
        ));
        self.store.update_event(event).await?;
        Ok(())
    }

    pub(crate) async fn record_conflict(
        &self,
        event: &mut TrackedEvent,
        remote: Option<&RemoteEventState>,
        reason: String,
    ) -> Result<(), EngineError> {
        let snapshot = remote
            .and_then(|state| state.payload.as_deref())
            .and_then(|payload| extract_event_snapshot(payload, Some(&event.uid)).ok());

        event.sync_conflict = true;
        event.sync_conflict_reason = Some(reason.clone());
        event.sync_conflict_snapshot = snapshot
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| EngineError::Data(err.to_string()))?;
        event.history.push(HistoryEntry::now("conflict", reason));
        self.store.update_event(event).await?;
        info!("Recorded sync conflict for {}", event.uid);
        Ok(())
    }

    /// Adopt the remote state locally: overwrite snapshot fields and payload,
    /// align the version counters, and stamp the remote as source of truth.
    /// The row identity is preserved; no remote mutation happens.
    pub(crate) async fn apply_remote(
        &self,
        event: &mut TrackedEvent,
        state: &RemoteEventState,
    ) -> Result<(), EngineError> {
        let payload = state.payload.clone().ok_or_else(|| {
            EngineError::Data(format!("remote state for {} has no payload", event.uid))
        })?;

        let decoded = parse_ics_payload(payload.as_bytes())?;
        let component = decoded
            .events
            .iter()
            .find(|component| component.uid == event.uid)
            .or_else(|| decoded.events.first())
            .ok_or_else(|| {
                EngineError::Data(format!("remote payload for {} has no VEVENT", event.uid))
            })?;

        event.summary = component.summary.clone();
        event.organizer = component.organizer.clone();
        event.start = component.start;
        event.end = component.end;
        event.payload = Some(payload);
        event.caldav_etag = state.etag.clone();
        event.remote_last_modified = state.last_modified;
        event.synced_version = event.local_version;
        event.last_modified_source = Some(ModificationSource::Remote);
        event.last_synced = Some(Utc::now());
        if component.status == EventStatus::Cancelled {
            event.status = EventStatus::Cancelled;
            event.cancelled_by_organizer = Some(true);
        } else {
            event.status = EventStatus::Synced;
        }
        event.sync_conflict = false;
        event.sync_conflict_reason = None;
        event.sync_conflict_snapshot = None;
        event
            .history
            .push(HistoryEntry::now("synced", "Änderungen aus CalDAV übernommen"));
        self.store.update_event(event).await?;
        info!("Fast-forwarded event {} from CalDAV", event.uid);
        Ok(())
    }
}
