use crate::error::JobError;
use crate::scheduler::{clamp_interval, Scheduler};
use crate::tracker::{JobTracker, JobUpdate};
use calsync_caldav::{CalDav, CalDavSettings};
use calsync_core::{
    Account, AccountKind, AutoSyncSettings, JobStatus, ManualSyncMissingDetail, ManualSyncOutcome,
    ResponseStatus, SyncMapping, TrackedEvent,
};
use calsync_engine::SyncEngine;
use calsync_ical::parse_ics_payload;
use calsync_imap::{FolderSelection, ImapSettings, MailSource, SourceProgress};
use calsync_security::SettingsCipher;
use calsync_store::Store;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub const AUTO_SYNC_JOB_ID: &str = "auto-sync";

#[derive(Debug, Clone)]
struct AutoSyncPreferences {
    auto_response: ResponseStatus,
    interval_minutes: u32,
}

impl Default for AutoSyncPreferences {
    fn default() -> Self {
        Self {
            auto_response: ResponseStatus::None,
            interval_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoSyncStatus {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub auto_response: ResponseStatus,
    pub active_job: Option<JobStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub details: Option<Value>,
}

/// Wires the store, engine and collaborators into background jobs with
/// tracked progress. The auto-sync cycle is single-flight: the scheduler may
/// fire at will, the job body drops overlapping ticks.
pub struct SyncRunner {
    store: Store,
    engine: SyncEngine,
    caldav: Arc<dyn CalDav>,
    mail: Arc<dyn MailSource>,
    cipher: Arc<SettingsCipher>,
    tracker: Arc<JobTracker>,
    auto_sync_job: Mutex<Option<String>>,
    preferences: Mutex<AutoSyncPreferences>,
}

impl SyncRunner {
    pub fn new(
        store: Store,
        caldav: Arc<dyn CalDav>,
        mail: Arc<dyn MailSource>,
        cipher: Arc<SettingsCipher>,
    ) -> Self {
        let engine = SyncEngine::new(store.clone(), caldav.clone());
        Self {
            store,
            engine,
            caldav,
            mail,
            cipher,
            tracker: Arc::new(JobTracker::new()),
            auto_sync_job: Mutex::new(None),
            preferences: Mutex::new(AutoSyncPreferences::default()),
        }
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.tracker.get(job_id).map(|state| state.to_status())
    }

    fn status_of(&self, job_id: &str) -> JobStatus {
        self.tracker
            .get(job_id)
            .map(|state| state.to_status())
            .unwrap_or(JobStatus {
                job_id: job_id.to_string(),
                status: "queued".to_string(),
                processed: 0,
                total: None,
                detail: None,
                message: None,
            })
    }

    fn imap_settings(&self, account: &Account) -> Result<ImapSettings, JobError> {
        let decrypted = self.cipher.decrypt_settings(&account.settings)?;
        serde_json::from_value(decrypted).map_err(|err| {
            JobError::Data(format!(
                "Ungültige IMAP Einstellungen für Konto {}: {err}",
                account.id
            ))
        })
    }

    fn caldav_settings(&self, account: &Account) -> Result<CalDavSettings, JobError> {
        let decrypted = self.cipher.decrypt_settings(&account.settings)?;
        serde_json::from_value(decrypted).map_err(|err| {
            JobError::Data(format!(
                "Ungültige CalDAV Einstellungen für Konto {}: {err}",
                account.id
            ))
        })
    }

    // -- scan ----------------------------------------------------------------

    pub fn start_scan_job(self: Arc<Self>) -> JobStatus {
        let state = self.tracker.create("scan", Some(0));
        self.tracker.update(
            &state.job_id,
            JobUpdate {
                status: Some("running".to_string()),
                processed: Some(0),
                total: Some(0),
                ..JobUpdate::default()
            },
        );

        let runner = self.clone();
        let job_id = state.job_id.clone();
        tokio::spawn(async move {
            runner.run_scan_job(&job_id).await;
        });
        self.status_of(&state.job_id)
    }

    async fn run_scan_job(&self, job_id: &str) {
        info!("Starting mailbox scan job {job_id}");
        self.tracker.update(
            job_id,
            JobUpdate {
                detail: Some(phase_detail(
                    "Postfach-Scan",
                    "Postfächer werden analysiert…",
                    0,
                    0,
                )),
                ..JobUpdate::default()
            },
        );

        let progress = self.scan_progress(job_id, "Postfächer werden analysiert…");
        match self.perform_mail_scan(Some(progress)).await {
            Ok((messages, events)) => {
                self.tracker.update(
                    job_id,
                    JobUpdate {
                        processed: Some(messages),
                        ..JobUpdate::default()
                    },
                );
                self.tracker.finish(
                    job_id,
                    Some(json!({
                        "messages_processed": messages,
                        "events_imported": events,
                        "phase": "Postfach-Scan",
                        "description": "Scan abgeschlossen",
                    })),
                );
            }
            Err(err) => {
                error!("Mailbox scan job {job_id} failed: {err}");
                self.tracker.fail(job_id, "Postfach-Scan fehlgeschlagen.");
            }
        }
    }

    /// Progress adapter feeding mailbox fetch deltas into the job registry.
    fn scan_progress(&self, job_id: &str, description: &str) -> SourceProgress {
        let tracker = self.tracker.clone();
        let job_id = job_id.to_string();
        let description = description.to_string();
        let counters = Arc::new(Mutex::new((0u64, 0u64)));
        Arc::new(move |processed_delta, total_delta| {
            let (processed, total) = {
                let mut guard = counters.lock().expect("progress counters poisoned");
                if total_delta > 0 {
                    guard.1 += total_delta;
                    tracker.increment(&job_id, 0, total_delta);
                }
                if processed_delta > 0 {
                    guard.0 += processed_delta;
                    tracker.increment(&job_id, processed_delta, 0);
                }
                *guard
            };
            tracker.update(
                &job_id,
                JobUpdate {
                    detail: Some(phase_detail("Postfach-Scan", &description, processed, total)),
                    ..JobUpdate::default()
                },
            );
        })
    }

    /// Scan every configured mailbox account and feed discovered calendar
    /// payloads through the ingest path. Returns (messages, imported events).
    pub async fn perform_mail_scan(
        &self,
        progress: Option<SourceProgress>,
    ) -> Result<(u64, u64), JobError> {
        let accounts = self.store.list_accounts_by_kind(AccountKind::Mailbox).await?;
        let mut messages_processed = 0u64;
        let mut events_imported = 0u64;

        for account in accounts {
            let settings = match self.imap_settings(&account) {
                Ok(settings) => settings,
                Err(err) => {
                    error!("{err}");
                    continue;
                }
            };
            let selections = folder_selections(&account);

            let candidates = match self
                .mail
                .fetch(&settings, &selections, progress.clone())
                .await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    error!("Postfach-Scan für Konto {} fehlgeschlagen: {err}", account.id);
                    continue;
                }
            };

            for candidate in candidates {
                messages_processed += 1;
                for attachment in &candidate.attachments {
                    let decoded = match parse_ics_payload(&attachment.payload) {
                        Ok(decoded) => decoded,
                        Err(err) => {
                            warn!(
                                "Überspringe fehlerhafte Kalenderdaten aus Nachricht {}: {err}",
                                candidate.message_id
                            );
                            continue;
                        }
                    };
                    let stored = self
                        .engine
                        .upsert_events(
                            &decoded.events,
                            &candidate.message_id,
                            Some(account.id),
                            Some(&candidate.folder),
                        )
                        .await?;
                    events_imported += stored.len() as u64;
                }
            }
        }

        Ok((messages_processed, events_imported))
    }

    // -- manual sync ---------------------------------------------------------

    pub fn start_manual_sync_job(self: Arc<Self>, event_ids: Vec<i64>) -> JobStatus {
        let state = self.tracker.create("manual-sync", Some(event_ids.len() as u64));
        if event_ids.is_empty() {
            let outcome = serde_json::to_value(ManualSyncOutcome::default()).unwrap_or(Value::Null);
            self.tracker.finish(&state.job_id, Some(outcome));
            return self.status_of(&state.job_id);
        }

        self.tracker.update(
            &state.job_id,
            JobUpdate {
                status: Some("running".to_string()),
                processed: Some(0),
                total: Some(event_ids.len() as u64),
                ..JobUpdate::default()
            },
        );
        let runner = self.clone();
        let job_id = state.job_id.clone();
        tokio::spawn(async move {
            runner.run_manual_sync_job(&job_id, event_ids).await;
        });
        self.status_of(&state.job_id)
    }

    pub(crate) async fn run_manual_sync_job(&self, job_id: &str, event_ids: Vec<i64>) {
        info!("Starting manual sync job {job_id}");
        match self.manual_sync_body(job_id, event_ids).await {
            Ok(Some(outcome)) => {
                let detail = serde_json::to_value(outcome).unwrap_or(Value::Null);
                self.tracker.finish(job_id, Some(detail));
            }
            // The body already failed the job with a specific message.
            Ok(None) => {}
            Err(err) => {
                error!("Manual sync job {job_id} failed: {err}");
                self.tracker.fail(job_id, "Synchronisation fehlgeschlagen.");
            }
        }
    }

    async fn manual_sync_body(
        &self,
        job_id: &str,
        event_ids: Vec<i64>,
    ) -> Result<Option<ManualSyncOutcome>, JobError> {
        let total = event_ids.len() as u64;
        let processed = AtomicU64::new(0);
        let mut missing: Vec<ManualSyncMissingDetail> = Vec::new();
        let mut uploaded: Vec<String> = Vec::new();

        let check_progress = |count: u64| {
            self.tracker.update(
                job_id,
                JobUpdate {
                    processed: Some(count),
                    detail: Some(phase_detail(
                        "Prüfung",
                        "Terminauswahl wird geprüft…",
                        count,
                        total,
                    )),
                    ..JobUpdate::default()
                },
            );
        };
        check_progress(0);

        let events = self.store.events_by_ids(&event_ids).await?;
        if events.is_empty() {
            self.tracker.fail(job_id, "Keine passenden Termine gefunden");
            return Ok(None);
        }

        struct SyncGroup {
            mapping: SyncMapping,
            settings: CalDavSettings,
            events: Vec<TrackedEvent>,
        }
        let mut groups: HashMap<i64, SyncGroup> = HashMap::new();

        for event in events {
            let reason = self.manual_sync_rejection(&event).await?;
            match reason {
                Some(reason) => {
                    missing.push(ManualSyncMissingDetail {
                        event_id: event.id,
                        uid: event.uid.clone(),
                        account_id: event.source_account_id,
                        folder: event.source_folder.clone(),
                        reason,
                    });
                    check_progress(processed.fetch_add(1, Ordering::SeqCst) + 1);
                }
                None => {
                    // Routing succeeded; group the event under its mapping.
                    let mapping = self
                        .store
                        .find_mapping_for_source(
                            event.source_account_id.unwrap_or_default(),
                            event.source_folder.as_deref().unwrap_or_default(),
                        )
                        .await?
                        .ok_or_else(|| {
                            JobError::Data(format!("mapping for event {} vanished", event.id))
                        })?;
                    let mapping_id = mapping.id;
                    if !groups.contains_key(&mapping_id) {
                        let account = self
                            .store
                            .get_account(mapping.calendar_account_id)
                            .await?
                            .ok_or_else(|| {
                                JobError::Data(format!(
                                    "calendar account {} vanished",
                                    mapping.calendar_account_id
                                ))
                            })?;
                        let settings = self.caldav_settings(&account)?;
                        groups.insert(
                            mapping_id,
                            SyncGroup {
                                mapping,
                                settings,
                                events: Vec::new(),
                            },
                        );
                    }
                    if let Some(group) = groups.get_mut(&mapping_id) {
                        group.events.push(event);
                    }
                }
            }
        }

        for group in groups.values() {
            let calendar_label = group
                .mapping
                .calendar_name
                .clone()
                .unwrap_or_else(|| group.mapping.calendar_url.clone());
            self.tracker.update(
                job_id,
                JobUpdate {
                    detail: Some(phase_detail(
                        "Synchronisation",
                        &format!(
                            "Synchronisiere {} Termine mit {calendar_label}",
                            group.events.len()
                        ),
                        processed.load(Ordering::SeqCst),
                        total,
                    )),
                    ..JobUpdate::default()
                },
            );

            let progress = |event: &TrackedEvent, _success: bool| {
                let count = processed.fetch_add(1, Ordering::SeqCst) + 1;
                let title = event.summary.clone().unwrap_or_else(|| event.uid.clone());
                self.tracker.update(
                    job_id,
                    JobUpdate {
                        processed: Some(count),
                        detail: Some(phase_detail(
                            "Synchronisation",
                            &format!("Übertrage \"{title}\""),
                            count,
                            total,
                        )),
                        ..JobUpdate::default()
                    },
                );
            };

            uploaded.extend(
                self.engine
                    .sync_events_to_calendar(
                        &group.events,
                        &group.mapping.calendar_url,
                        &group.settings,
                        Some(&progress),
                    )
                    .await?,
            );
        }

        Ok(Some(ManualSyncOutcome { uploaded, missing }))
    }

    /// Pre-flight check for manual sync; returns the human-readable reason
    /// when the event cannot be routed.
    async fn manual_sync_rejection(
        &self,
        event: &TrackedEvent,
    ) -> Result<Option<String>, JobError> {
        if event.tracking_disabled {
            info!(
                "Skipping manual sync for {} because tracking is disabled",
                event.uid
            );
            return Ok(Some(
                "Tracking für diesen Termin wurde deaktiviert".to_string(),
            ));
        }
        if event.sync_conflict {
            info!(
                "Skipping manual sync for {} due to existing conflict",
                event.uid
            );
            return Ok(Some(
                "Synchronisationskonflikt muss zuerst gelöst werden".to_string(),
            ));
        }
        let (Some(account_id), Some(folder)) =
            (event.source_account_id, event.source_folder.as_deref())
        else {
            return Ok(Some("Keine Quellinformationen vorhanden".to_string()));
        };

        let Some(mapping) = self.store.find_mapping_for_source(account_id, folder).await? else {
            return Ok(Some(
                "Keine Sync-Zuordnung für Konto und Ordner".to_string(),
            ));
        };

        let account = self.store.get_account(mapping.calendar_account_id).await?;
        let Some(account) = account.filter(|account| account.kind == AccountKind::Calendar) else {
            return Ok(Some(
                "Zugeordnetes CalDAV-Konto nicht gefunden".to_string(),
            ));
        };

        if let Err(err) = self.caldav_settings(&account) {
            error!("CalDAV settings invalid for account {}", account.id);
            return Ok(Some(format!("Ungültige CalDAV Einstellungen: {err}")));
        }

        Ok(None)
    }

    // -- sync all ------------------------------------------------------------

    pub fn start_sync_all_job(self: Arc<Self>) -> JobStatus {
        let state = self.tracker.create("sync-all", Some(0));
        self.tracker.update(
            &state.job_id,
            JobUpdate {
                status: Some("running".to_string()),
                processed: Some(0),
                total: Some(0),
                ..JobUpdate::default()
            },
        );
        let runner = self.clone();
        let job_id = state.job_id.clone();
        tokio::spawn(async move {
            runner.run_sync_all_job(&job_id).await;
        });
        self.status_of(&state.job_id)
    }

    pub(crate) async fn run_sync_all_job(&self, job_id: &str) {
        info!("Starting sync-all job {job_id}");
        self.tracker.update(
            job_id,
            JobUpdate {
                detail: Some(phase_detail(
                    "Synchronisation",
                    "Kalenderabgleich läuft…",
                    0,
                    0,
                )),
                ..JobUpdate::default()
            },
        );

        let counters = Mutex::new((0u64, 0u64));
        let progress = |processed_delta: u64, total_delta: u64| {
            let (processed, total) = {
                let mut guard = counters.lock().expect("progress counters poisoned");
                if total_delta > 0 {
                    guard.1 += total_delta;
                    self.tracker.increment(job_id, 0, total_delta);
                }
                if processed_delta > 0 {
                    guard.0 += processed_delta;
                }
                *guard
            };
            if processed_delta > 0 {
                self.tracker.update(
                    job_id,
                    JobUpdate {
                        processed: Some(processed),
                        detail: Some(phase_detail(
                            "Synchronisation",
                            "Kalenderabgleich läuft…",
                            processed,
                            total,
                        )),
                        ..JobUpdate::default()
                    },
                );
            }
        };

        match self.perform_sync_all(false, Some(&progress)).await {
            Ok(uploaded) => {
                self.tracker.finish(
                    job_id,
                    Some(json!({
                        "uploaded": uploaded,
                        "phase": "Synchronisation",
                        "description": "Kalenderabgleich abgeschlossen",
                    })),
                );
            }
            Err(err) => {
                error!("Sync-all job {job_id} failed: {err}");
                self.tracker.fail(job_id, "Synchronisation fehlgeschlagen.");
            }
        }
    }

    /// Synchronize all eligible events mapping by mapping. Returns the UIDs
    /// of the uploaded event payloads.
    pub async fn perform_sync_all(
        &self,
        apply_auto_response: bool,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> Result<Vec<String>, JobError> {
        let mut total_uploaded: Vec<String> = Vec::new();
        let auto_response = self
            .preferences
            .lock()
            .expect("preferences poisoned")
            .auto_response;

        for mapping in self.store.list_mappings().await? {
            let Some(account) = self.store.get_account(mapping.calendar_account_id).await? else {
                warn!("CalDAV account {} not found", mapping.calendar_account_id);
                continue;
            };
            let settings = match self.caldav_settings(&account) {
                Ok(settings) => settings,
                Err(err) => {
                    error!("{err}");
                    continue;
                }
            };

            let events = self
                .store
                .sync_candidates(mapping.mailbox_account_id, &mapping.mailbox_folder)
                .await?;
            if events.is_empty() {
                continue;
            }
            if let Some(progress) = progress {
                progress(0, events.len() as u64);
            }

            let per_event = |_event: &TrackedEvent, _success: bool| {
                if let Some(progress) = progress {
                    progress(1, 0);
                }
            };
            let uploaded = self
                .engine
                .sync_events_to_calendar(
                    &events,
                    &mapping.calendar_url,
                    &settings,
                    Some(&per_event),
                )
                .await?;
            total_uploaded.extend(uploaded.iter().cloned());

            if apply_auto_response
                && auto_response == ResponseStatus::Accepted
                && !uploaded.is_empty()
            {
                let mut accepted = Vec::new();
                for event in &events {
                    if !uploaded.contains(&event.uid) {
                        continue;
                    }
                    match self.engine.apply_auto_accept(event.id).await {
                        Ok(updated) => accepted.push(updated),
                        Err(err) => warn!("Auto accept for {} failed: {err}", event.uid),
                    }
                }
                if !accepted.is_empty() {
                    if let Err(err) = self
                        .engine
                        .sync_events_to_calendar(&accepted, &mapping.calendar_url, &settings, None)
                        .await
                    {
                        error!(
                            "Automatische Zusage für Mapping {} konnte nicht zum Kalender synchronisiert werden: {err}",
                            mapping.id
                        );
                    }
                }
            }
        }
        Ok(total_uploaded)
    }

    // -- auto sync -----------------------------------------------------------

    /// Run one scan-then-sync cycle. Single-flight: returns `None` without
    /// doing anything when a previous cycle is still running.
    pub async fn run_auto_sync_cycle(&self) -> Option<String> {
        let job_id = {
            let mut guard = self.auto_sync_job.lock().expect("auto-sync guard poisoned");
            if guard.is_some() {
                info!("Auto sync job already running, skipping invocation");
                return None;
            }
            let state = self.tracker.create(AUTO_SYNC_JOB_ID, Some(0));
            *guard = Some(state.job_id.clone());
            state.job_id
        };

        self.tracker.update(
            &job_id,
            JobUpdate {
                status: Some("running".to_string()),
                processed: Some(0),
                total: Some(0),
                detail: Some(phase_detail(
                    "Postfach-Scan",
                    "AutoSync: Postfächer werden analysiert…",
                    0,
                    0,
                )),
                ..JobUpdate::default()
            },
        );

        match self.auto_sync_body(&job_id).await {
            Ok((messages, events, uploaded)) => {
                self.tracker.finish(
                    &job_id,
                    Some(json!({
                        "messages_processed": messages,
                        "events_imported": events,
                        "uploaded": uploaded,
                        "phase": "Synchronisation",
                        "description": "AutoSync abgeschlossen",
                    })),
                );
            }
            Err(err) => {
                error!("Auto sync job {job_id} failed: {err}");
                self.tracker.fail(&job_id, "AutoSync fehlgeschlagen.");
            }
        }

        self.auto_sync_job
            .lock()
            .expect("auto-sync guard poisoned")
            .take();
        Some(job_id)
    }

    async fn auto_sync_body(&self, job_id: &str) -> Result<(u64, u64, Vec<String>), JobError> {
        let scan_progress =
            self.scan_progress(job_id, "AutoSync: Postfächer werden analysiert…");
        let (messages, events) = self.perform_mail_scan(Some(scan_progress)).await?;

        self.tracker.update(
            job_id,
            JobUpdate {
                detail: Some(phase_detail(
                    "Synchronisation",
                    "AutoSync: Kalenderabgleich läuft…",
                    0,
                    0,
                )),
                ..JobUpdate::default()
            },
        );

        let counters = Mutex::new((0u64, 0u64));
        let sync_progress = |processed_delta: u64, total_delta: u64| {
            let (processed, total) = {
                let mut guard = counters.lock().expect("progress counters poisoned");
                if total_delta > 0 {
                    guard.1 += total_delta;
                    self.tracker.increment(job_id, 0, total_delta);
                }
                if processed_delta > 0 {
                    guard.0 += processed_delta;
                    self.tracker.increment(job_id, processed_delta, 0);
                }
                *guard
            };
            self.tracker.update(
                job_id,
                JobUpdate {
                    detail: Some(phase_detail(
                        "Synchronisation",
                        "AutoSync: Kalenderabgleich läuft…",
                        processed,
                        total,
                    )),
                    ..JobUpdate::default()
                },
            );
        };
        let uploaded = self.perform_sync_all(true, Some(&sync_progress)).await?;

        Ok((messages, events, uploaded))
    }

    /// Apply auto-sync settings: update preferences and (re)schedule or
    /// cancel the periodic cycle.
    pub fn configure_auto_sync(
        self: Arc<Self>,
        scheduler: &Scheduler,
        settings: AutoSyncSettings,
    ) -> AutoSyncStatus {
        let auto_response = match settings.auto_response {
            ResponseStatus::None | ResponseStatus::Accepted => settings.auto_response,
            other => {
                warn!(
                    "Unsupported auto response {}, falling back to none",
                    other.as_str()
                );
                ResponseStatus::None
            }
        };
        let interval_minutes = clamp_interval(settings.interval_minutes);

        {
            let mut preferences = self.preferences.lock().expect("preferences poisoned");
            if preferences.interval_minutes != interval_minutes {
                info!(
                    "Updating auto sync interval from {} to {} minutes",
                    preferences.interval_minutes, interval_minutes
                );
            }
            preferences.auto_response = auto_response;
            preferences.interval_minutes = interval_minutes;
        }

        if settings.enabled {
            let runner = self.clone();
            scheduler.schedule_job(AUTO_SYNC_JOB_ID, interval_minutes, move || {
                let runner = runner.clone();
                async move {
                    runner.run_auto_sync_cycle().await;
                }
            });
            info!("Auto sync enabled");
        } else {
            scheduler.cancel_job(AUTO_SYNC_JOB_ID);
            info!("Auto sync disabled");
        }

        self.auto_sync_status(scheduler)
    }

    pub fn auto_sync_status(&self, scheduler: &Scheduler) -> AutoSyncStatus {
        let preferences = self
            .preferences
            .lock()
            .expect("preferences poisoned")
            .clone();
        AutoSyncStatus {
            enabled: scheduler.is_job_active(AUTO_SYNC_JOB_ID),
            interval_minutes: preferences.interval_minutes,
            auto_response: preferences.auto_response,
            active_job: self.active_auto_sync_job(),
        }
    }

    fn active_auto_sync_job(&self) -> Option<JobStatus> {
        let job_id = self
            .auto_sync_job
            .lock()
            .expect("auto-sync guard poisoned")
            .clone()?;
        self.job_status(&job_id)
    }

    // -- response updates ----------------------------------------------------

    /// Record a participation answer and immediately push the annotated
    /// payload through the event's mapping when one exists.
    pub async fn update_event_response(
        &self,
        event_id: i64,
        response: ResponseStatus,
    ) -> Result<TrackedEvent, JobError> {
        let event = self.engine.update_response(event_id, response).await?;

        let routing = match (event.source_account_id, event.source_folder.as_deref()) {
            (Some(account_id), Some(folder)) => {
                self.store.find_mapping_for_source(account_id, folder).await?
            }
            _ => None,
        };
        let Some(mapping) = routing else {
            info!(
                "Kalendersync für Termin {} übersprungen (fehlendes Mapping oder Einstellungen)",
                event.uid
            );
            return Ok(event);
        };

        let Some(account) = self.store.get_account(mapping.calendar_account_id).await? else {
            warn!(
                "CalDAV account {} nicht gefunden für Mapping {}",
                mapping.calendar_account_id, mapping.id
            );
            return Ok(event);
        };
        let settings = match self.caldav_settings(&account) {
            Ok(settings) => settings,
            Err(err) => {
                error!("{err}");
                return Ok(event);
            }
        };

        if let Err(err) = self
            .engine
            .sync_events_to_calendar(
                &[event.clone()],
                &mapping.calendar_url,
                &settings,
                None,
            )
            .await
        {
            error!("Failed to sync event {} after response update: {err}", event.uid);
        }

        Ok(self
            .store
            .get_event(event_id)
            .await?
            .unwrap_or(event))
    }

    // -- connection tests ----------------------------------------------------

    pub async fn test_connection(
        &self,
        kind: AccountKind,
        settings: &Value,
    ) -> ConnectionTestResult {
        match kind {
            AccountKind::Mailbox => {
                let settings: ImapSettings = match self
                    .cipher
                    .decrypt_settings(settings)
                    .map_err(JobError::from)
                    .and_then(|value| serde_json::from_value(value).map_err(JobError::from))
                {
                    Ok(settings) => settings,
                    Err(err) => return connection_failure(err),
                };
                match self
                    .mail
                    .fetch(&settings, &[FolderSelection::new("INBOX")], None)
                    .await
                {
                    Ok(_) => ConnectionTestResult {
                        success: true,
                        message: "IMAP connection successful".to_string(),
                        details: None,
                    },
                    Err(err) => connection_failure(err),
                }
            }
            AccountKind::Calendar => {
                let settings: CalDavSettings = match self
                    .cipher
                    .decrypt_settings(settings)
                    .map_err(JobError::from)
                    .and_then(|value| serde_json::from_value(value).map_err(JobError::from))
                {
                    Ok(settings) => settings,
                    Err(err) => return connection_failure(err),
                };
                match self.caldav.list_calendars(&settings).await {
                    Ok(calendars) => ConnectionTestResult {
                        success: true,
                        message: "CalDAV connection successful".to_string(),
                        details: serde_json::to_value(calendars)
                            .ok()
                            .map(|value| json!({ "calendars": value })),
                    },
                    Err(err) => connection_failure(err),
                }
            }
        }
    }
}

fn connection_failure(error: impl std::fmt::Display) -> ConnectionTestResult {
    error!("Connection test failed: {error}");
    ConnectionTestResult {
        success: false,
        message: error.to_string(),
        details: None,
    }
}

fn phase_detail(phase: &str, description: &str, processed: u64, total: u64) -> Value {
    json!({
        "phase": phase,
        "description": description,
        "processed": processed,
        "total": total,
    })
}

/// Folder selections for a mailbox account, defaulting to INBOX.
fn folder_selections(account: &Account) -> Vec<FolderSelection> {
    let mut selections: Vec<FolderSelection> = account
        .folders
        .iter()
        .map(|folder| FolderSelection {
            name: folder.name.clone(),
            include_subfolders: folder.include_subfolders,
        })
        .collect();
    if selections.is_empty() {
        selections.push(FolderSelection::new("INBOX"));
    }
    selections
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use calsync_caldav::{CalDavError, CalendarInfo, RemoteEventState, RemoteEventSummary};
    use calsync_core::{EventStatus, HistoryEntry, ModificationSource};
    use calsync_imap::{CalendarCandidate, ImapError, MailAttachment};
    use calsync_store::{NewAccount, NewFolderSelection, NewSyncMapping};
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    const CAL_URL: &str = "https://dav.example.com/cal";

    #[derive(Default)]
    struct MockCalDav {
        uploads: Mutex<Vec<(String, String)>>,
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
            _uid: &str,
        ) -> Result<bool, CalDavError> {
            Ok(false)
        }

        async fn get_event_state(
            &self,
            _settings: &CalDavSettings,
            _calendar_url: &str,
            _uid: &str,
        ) -> Result<Option<RemoteEventState>, CalDavError> {
            Ok(None)
        }

        async fn search_overlapping(
            &self,
            _settings: &CalDavSettings,
            _calendar_url: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<RemoteEventSummary>, CalDavError> {
            Ok(Vec::new())
        }

        async fn list_calendars(
            &self,
            _settings: &CalDavSettings,
        ) -> Result<Vec<CalendarInfo>, CalDavError> {
            Ok(vec![CalendarInfo {
                url: CAL_URL.to_string(),
                name: "Arbeit".to_string(),
            }])
        }
    }

    #[derive(Default)]
    struct MockMailSource {
        candidates: Mutex<Vec<CalendarCandidate>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl MailSource for MockMailSource {
        async fn fetch(
            &self,
            _settings: &ImapSettings,
            _folders: &[FolderSelection],
            progress: Option<SourceProgress>,
        ) -> Result<Vec<CalendarCandidate>, ImapError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let candidates = self.candidates.lock().unwrap().clone();
            if let Some(progress) = progress {
                progress(0, candidates.len() as u64);
                for _ in &candidates {
                    progress(1, 0);
                }
            }
            Ok(candidates)
        }

        async fn delete_message(
            &self,
            _settings: &ImapSettings,
            _folder: &str,
            _message_id: &str,
        ) -> Result<bool, ImapError> {
            Ok(true)
        }
    }

    fn request_ics(uid: &str) -> String {
        [
            "BEGIN:VCALENDAR",
            "VERSION:2.0",
            "METHOD:REQUEST",
            "BEGIN:VEVENT",
            &format!("UID:{uid}"),
            "SUMMARY:Kickoff",
            "DTSTART:20240101T090000Z",
            "DTEND:20240101T100000Z",
            "END:VEVENT",
            "END:VCALENDAR",
            "",
        ]
        .join("\r\n")
    }

    fn candidate(message_id: &str, payload: &[u8]) -> CalendarCandidate {
        CalendarCandidate {
            message_id: message_id.to_string(),
            subject: "Einladung".to_string(),
            sender: "chef@example.com".to_string(),
            folder: "INBOX".to_string(),
            attachments: vec![MailAttachment {
                filename: "invite.ics".to_string(),
                content_type: "text/calendar".to_string(),
                payload: payload.to_vec(),
            }],
            links: Vec::new(),
        }
    }

    async fn runner_with(
        mail: Arc<MockMailSource>,
        caldav: Arc<MockCalDav>,
    ) -> Arc<SyncRunner> {
        let store = Store::connect_in_memory().await.expect("store");
        store.initialize().await.expect("schema");
        Arc::new(SyncRunner::new(
            store,
            caldav,
            mail,
            Arc::new(SettingsCipher::new("test-secret")),
        ))
    }

    async fn seed_accounts_and_mapping(runner: &SyncRunner) -> (i64, i64) {
        let mailbox = runner
            .store
            .create_account(&NewAccount {
                label: "Mail".to_string(),
                kind: AccountKind::Mailbox,
                settings: json!({
                    "host": "imap.example.com",
                    "username": "alex",
                    "password": "secret",
                }),
                folders: vec![NewFolderSelection {
                    name: "INBOX".to_string(),
                    include_subfolders: true,
                }],
            })
            .await
            .expect("mailbox account");
        let calendar = runner
            .store
            .create_account(&NewAccount {
                label: "Kalender".to_string(),
                kind: AccountKind::Calendar,
                settings: json!({
                    "url": "https://dav.example.com",
                    "username": "alex",
                    "password": "secret",
                }),
                folders: vec![],
            })
            .await
            .expect("calendar account");
        runner
            .store
            .create_mapping(&NewSyncMapping {
                mailbox_account_id: mailbox.id,
                mailbox_folder: "INBOX".to_string(),
                calendar_account_id: calendar.id,
                calendar_url: CAL_URL.to_string(),
                calendar_name: Some("Arbeit".to_string()),
            })
            .await
            .expect("mapping");
        (mailbox.id, calendar.id)
    }

    fn tracked_event(uid: &str, account_id: i64) -> TrackedEvent {
        let now = Utc::now();
        TrackedEvent {
            id: 0,
            uid: uid.to_string(),
            mailbox_message_id: Some("42".to_string()),
            source_account_id: Some(account_id),
            source_folder: Some("INBOX".to_string()),
            summary: Some("Kickoff".to_string()),
            organizer: Some("chef@example.com".to_string()),
            start: None,
            end: None,
            status: EventStatus::New,
            response_status: ResponseStatus::None,
            cancelled_by_organizer: None,
            payload: Some(request_ics(uid)),
            last_synced: None,
            history: vec![HistoryEntry::now("new", "Event processed from message 42")],
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

    #[tokio::test]
    async fn scan_imports_calendar_candidates() {
        let mail = Arc::new(MockMailSource::default());
        mail.candidates.lock().unwrap().extend([
            candidate("1", request_ics("u1").as_bytes()),
            candidate("2", b"not a calendar at all"),
        ]);
        let runner = runner_with(mail, Arc::new(MockCalDav::default())).await;
        seed_accounts_and_mapping(&runner).await;

        let (messages, events) = runner.perform_mail_scan(None).await.expect("scan");
        assert_eq!(messages, 2);
        assert_eq!(events, 1);

        let stored = runner
            .store
            .find_event_by_uid("u1")
            .await
            .expect("query")
            .expect("event imported");
        assert_eq!(stored.status, EventStatus::New);
        assert_eq!(stored.source_folder.as_deref(), Some("INBOX"));
    }

    #[tokio::test]
    async fn manual_sync_filters_unroutable_events() {
        let runner = runner_with(
            Arc::new(MockMailSource::default()),
            Arc::new(MockCalDav::default()),
        )
        .await;
        let (mailbox_id, _) = seed_accounts_and_mapping(&runner).await;

        let routable = runner
            .store
            .insert_event(&tracked_event("ok", mailbox_id))
            .await
            .expect("insert");

        let mut disabled = tracked_event("disabled", mailbox_id);
        disabled.tracking_disabled = true;
        let disabled = runner.store.insert_event(&disabled).await.expect("insert");

        let mut conflicted = tracked_event("conflicted", mailbox_id);
        conflicted.sync_conflict = true;
        let conflicted = runner.store.insert_event(&conflicted).await.expect("insert");

        let mut orphan = tracked_event("orphan", mailbox_id);
        orphan.source_account_id = None;
        orphan.source_folder = None;
        let orphan = runner.store.insert_event(&orphan).await.expect("insert");

        let mut unmapped = tracked_event("unmapped", mailbox_id);
        unmapped.source_folder = Some("Archiv".to_string());
        let unmapped = runner.store.insert_event(&unmapped).await.expect("insert");

        let state = runner.tracker.create("manual-sync", Some(5));
        runner
            .run_manual_sync_job(
                &state.job_id,
                vec![routable.id, disabled.id, conflicted.id, orphan.id, unmapped.id],
            )
            .await;

        let finished = runner.tracker.get(&state.job_id).expect("job state");
        assert_eq!(finished.status, "completed");
        let detail = finished.detail.expect("detail");
        let outcome: ManualSyncOutcome = serde_json::from_value(detail).expect("outcome");

        assert_eq!(outcome.uploaded, vec!["ok".to_string()]);
        assert_eq!(outcome.missing.len(), 4);

        let reason_for = |id: i64| {
            outcome
                .missing
                .iter()
                .find(|entry| entry.event_id == id)
                .map(|entry| entry.reason.clone())
                .expect("missing entry")
        };
        assert_eq!(
            reason_for(disabled.id),
            "Tracking für diesen Termin wurde deaktiviert"
        );
        assert!(reason_for(conflicted.id).to_lowercase().contains("konflikt"));
        assert_eq!(reason_for(orphan.id), "Keine Quellinformationen vorhanden");
        assert_eq!(
            reason_for(unmapped.id),
            "Keine Sync-Zuordnung für Konto und Ordner"
        );
    }

    #[tokio::test]
    async fn manual_sync_with_empty_selection_completes_immediately() {
        let runner = runner_with(
            Arc::new(MockMailSource::default()),
            Arc::new(MockCalDav::default()),
        )
        .await;

        let status = runner.clone().start_manual_sync_job(Vec::new());
        assert_eq!(status.status, "completed");
        let outcome: ManualSyncOutcome =
            serde_json::from_value(status.detail.expect("detail")).expect("outcome");
        assert!(outcome.uploaded.is_empty());
        assert!(outcome.missing.is_empty());
    }

    #[tokio::test]
    async fn sync_all_uploads_only_eligible_events() {
        let caldav = Arc::new(MockCalDav::default());
        let runner = runner_with(Arc::new(MockMailSource::default()), caldav.clone()).await;
        let (mailbox_id, _) = seed_accounts_and_mapping(&runner).await;

        runner
            .store
            .insert_event(&tracked_event("pending", mailbox_id))
            .await
            .expect("insert");
        let mut conflicted = tracked_event("conflicted", mailbox_id);
        conflicted.sync_conflict = true;
        runner.store.insert_event(&conflicted).await.expect("insert");
        let mut disabled = tracked_event("disabled", mailbox_id);
        disabled.tracking_disabled = true;
        runner.store.insert_event(&disabled).await.expect("insert");

        let uploaded = runner.perform_sync_all(false, None).await.expect("sync");
        assert_eq!(uploaded, vec!["pending".to_string()]);

        let uploads = caldav.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "pending");
    }

    #[tokio::test]
    async fn auto_response_accepts_freshly_uploaded_events() {
        let caldav = Arc::new(MockCalDav::default());
        let runner = runner_with(Arc::new(MockMailSource::default()), caldav.clone()).await;
        let (mailbox_id, _) = seed_accounts_and_mapping(&runner).await;
        let stored = runner
            .store
            .insert_event(&tracked_event("u1", mailbox_id))
            .await
            .expect("insert");

        let scheduler = Scheduler::new();
        runner.clone().configure_auto_sync(
            &scheduler,
            AutoSyncSettings {
                enabled: false,
                interval_minutes: 5,
                auto_response: ResponseStatus::Accepted,
            },
        );

        let uploaded = runner.perform_sync_all(true, None).await.expect("sync");
        assert_eq!(uploaded, vec!["u1".to_string()]);

        let refreshed = runner
            .store
            .get_event(stored.id)
            .await
            .expect("query")
            .expect("row");
        assert_eq!(refreshed.response_status, ResponseStatus::Accepted);
        assert!(refreshed
            .history
            .iter()
            .any(|entry| entry.description == "Automatisch zugesagt (AutoSync)"));

        // The accepted payload was pushed in a second upload.
        let uploads = caldav.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        assert!(uploads[1].1.contains("X-CALSYNC-RESPONSE:ACCEPTED"));
    }

    #[tokio::test]
    async fn unsupported_auto_response_falls_back_to_none() {
        let runner = runner_with(
            Arc::new(MockMailSource::default()),
            Arc::new(MockCalDav::default()),
        )
        .await;
        let scheduler = Scheduler::new();

        let status = runner.clone().configure_auto_sync(
            &scheduler,
            AutoSyncSettings {
                enabled: false,
                interval_minutes: 9_999,
                auto_response: ResponseStatus::Declined,
            },
        );
        assert_eq!(status.auto_response, ResponseStatus::None);
        assert_eq!(status.interval_minutes, 720);
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn auto_sync_is_single_flight() {
        let mail = Arc::new(MockMailSource {
            candidates: Mutex::new(Vec::new()),
            delay: Some(Duration::from_millis(200)),
        });
        let runner = runner_with(mail, Arc::new(MockCalDav::default())).await;
        seed_accounts_and_mapping(&runner).await;

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_auto_sync_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = runner.run_auto_sync_cycle().await;
        assert!(second.is_none(), "overlapping tick must be dropped");

        let first = first.await.expect("join").expect("first cycle ran");
        let state = runner.tracker.get(&first).expect("job state");
        assert_eq!(state.status, "completed");

        // With the guard released, the next tick runs again.
        assert!(runner.run_auto_sync_cycle().await.is_some());
    }

    #[tokio::test]
    async fn response_update_is_pushed_through_the_mapping() {
        let caldav = Arc::new(MockCalDav::default());
        let runner = runner_with(Arc::new(MockMailSource::default()), caldav.clone()).await;
        let (mailbox_id, _) = seed_accounts_and_mapping(&runner).await;
        let stored = runner
            .store
            .insert_event(&tracked_event("u1", mailbox_id))
            .await
            .expect("insert");

        let updated = runner
            .update_event_response(stored.id, ResponseStatus::Accepted)
            .await
            .expect("response update");

        assert_eq!(updated.response_status, ResponseStatus::Accepted);
        assert_eq!(updated.status, EventStatus::Synced);
        assert_eq!(updated.synced_version, updated.local_version);
        assert!(updated
            .history
            .iter()
            .any(|entry| entry.description == "Teilnahme zugesagt"));

        let uploads = caldav.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].1.contains("X-CALSYNC-RESPONSE:ACCEPTED"));
    }

    #[tokio::test]
    async fn connection_test_reports_calendars() {
        let runner = runner_with(
            Arc::new(MockMailSource::default()),
            Arc::new(MockCalDav::default()),
        )
        .await;

        let result = runner
            .test_connection(
                AccountKind::Calendar,
                &json!({"url": "https://dav.example.com", "password": "secret"}),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.message, "CalDAV connection successful");
        let calendars = &result.details.expect("details")["calendars"];
        assert_eq!(calendars[0]["name"], "Arbeit");

        let mailbox = runner
            .test_connection(
                AccountKind::Mailbox,
                &json!({"host": "imap.example.com", "username": "alex", "password": "x"}),
            )
            .await;
        assert!(mailbox.success);
    }
}

