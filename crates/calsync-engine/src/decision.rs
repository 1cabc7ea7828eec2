use calsync_caldav::RemoteEventState;
use calsync_core::{EventStatus, ModificationSource, TrackedEvent};

/// What the export path should do for one (local, remote) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Push the stored payload and mark the event synced.
    Upload,
    /// Push the cancellation. `legacy_attribution` marks rows predating the
    /// cancellation attribution column, which are treated as
    /// organizer-initiated.
    Cancel { legacy_attribution: bool },
    /// Adopt the remote state locally without any remote mutation.
    FastForward,
    /// Both sides changed; quarantine for the user.
    RecordConflict { reason: String },
    Skip { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Attendee-side cancellations never touch the calendar.
    AttendeeCancellation,
    /// The cancellation already came from the calendar; nothing to push.
    RemoteCancellation,
}

/// Pure reconciliation decision over the event row and the probed remote
/// state. The ETag comparison wins whenever both sides carry one; the
/// LAST-MODIFIED baseline is only consulted otherwise.
pub fn decide(event: &TrackedEvent, remote: Option<&RemoteEventState>) -> Decision {
    let divergence = remote.and_then(|remote| remote_divergence(event, remote));
    let local_changed = event.has_local_changes();

    if let Some(reason) = divergence {
        if local_changed {
            return Decision::RecordConflict { reason };
        }
        return Decision::FastForward;
    }

    if event.status == EventStatus::Cancelled {
        if event.cancelled_by_organizer == Some(false) {
            return Decision::Skip {
                reason: SkipReason::AttendeeCancellation,
            };
        }
        if event.last_modified_source == Some(ModificationSource::Remote) && !local_changed {
            return Decision::Skip {
                reason: SkipReason::RemoteCancellation,
            };
        }
        return Decision::Cancel {
            legacy_attribution: event.cancelled_by_organizer.is_none(),
        };
    }

    Decision::Upload
}

fn remote_divergence(event: &TrackedEvent, remote: &RemoteEventState) -> Option<String> {
    if let (Some(local_etag), Some(remote_etag)) = (&event.caldav_etag, &remote.etag) {
        if local_etag != remote_etag {
            return Some(
                "Kalendereintrag wurde extern geändert (ETag weicht ab)".to_string(),
            );
        }
        return None;
    }

    let remote_modified = remote.last_modified?;
    let baseline = event.remote_last_modified.max(event.last_synced)?;
    if remote_modified > baseline {
        return Some(
            "Kalendereintrag wurde extern geändert (LAST-MODIFIED neuer als letzter Abgleich)"
                .to_string(),
        );
    }
    None
}
