use crate::error::StoreError;
use crate::history::normalize_history;
use crate::schema;
use calsync_core::{
    Account, AccountKind, EventStatus, HistoryEntry, IgnoredMailImport, MailboxFolder,
    ModificationSource, ResponseStatus, SyncMapping, TrackedEvent,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct NewFolderSelection {
    pub name: String,
    pub include_subfolders: bool,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub label: String,
    pub kind: AccountKind,
    pub settings: Value,
    pub folders: Vec<NewFolderSelection>,
}

#[derive(Debug, Clone)]
pub struct NewSyncMapping {
    pub mailbox_account_id: i64,
    pub mailbox_folder: String,
    pub calendar_account_id: i64,
    pub calendar_url: String,
    pub calendar_name: Option<String>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// A private in-memory database; the pool is capped at one connection so
    /// every handle sees the same data.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Create missing tables and run the idempotent upgrade pass.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        schema::ensure_schema(&self.pool).await?;
        schema::apply_schema_upgrades(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- accounts ------------------------------------------------------------

    pub async fn create_account(&self, account: &NewAccount) -> Result<Account, StoreError> {
        let now = Utc::now().to_rfc3339();
        let settings = serde_json::to_string(&account.settings)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (label, kind, settings, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&account.label)
        .bind(account.kind.as_str())
        .bind(settings)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let account_id = result.last_insert_rowid();

        for folder in &account.folders {
            sqlx::query(
                "INSERT INTO mailbox_folders (account_id, name, include_subfolders) VALUES (?1, ?2, ?3)",
            )
            .bind(account_id)
            .bind(&folder.name)
            .bind(folder.include_subfolders)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_account(account_id)
            .await?
            .ok_or_else(|| StoreError::Data(format!("account {account_id} vanished after insert")))
    }

    /// Update an account; the folder selection list is rebuilt from scratch.
    pub async fn update_account(
        &self,
        account_id: i64,
        account: &NewAccount,
    ) -> Result<Option<Account>, StoreError> {
        if self.get_account(account_id).await?.is_none() {
            return Ok(None);
        }

        let settings = serde_json::to_string(&account.settings)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE accounts SET label = ?1, kind = ?2, settings = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(&account.label)
        .bind(account.kind.as_str())
        .bind(settings)
        .bind(Utc::now().to_rfc3339())
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM mailbox_folders WHERE account_id = ?1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        if account.kind == AccountKind::Mailbox {
            for folder in &account.folders {
                sqlx::query(
                    "INSERT INTO mailbox_folders (account_id, name, include_subfolders) VALUES (?1, ?2, ?3)",
                )
                .bind(account_id)
                .bind(&folder.name)
                .bind(folder.include_subfolders)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        self.get_account(account_id).await
    }

    /// Delete an account, detaching its tracked events and removing every
    /// mapping that references it.
    pub async fn delete_account(&self, account_id: i64) -> Result<bool, StoreError> {
        if self.get_account(account_id).await?.is_none() {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM sync_mappings WHERE mailbox_account_id = ?1 OR calendar_account_id = ?1",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE tracked_events SET source_account_id = NULL WHERE source_account_id = ?1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mailbox_folders WHERE account_id = ?1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_account(&self, account_id: i64) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_account(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            accounts.push(self.hydrate_account(row).await?);
        }
        Ok(accounts)
    }

    pub async fn list_accounts_by_kind(&self, kind: AccountKind) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE kind = ?1 ORDER BY id")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            accounts.push(self.hydrate_account(row).await?);
        }
        Ok(accounts)
    }

    async fn hydrate_account(&self, row: SqliteRow) -> Result<Account, StoreError> {
        let mut account = row_to_account(&row)?;
        let folder_rows =
            sqlx::query("SELECT * FROM mailbox_folders WHERE account_id = ?1 ORDER BY id")
                .bind(account.id)
                .fetch_all(&self.pool)
                .await?;
        account.folders = folder_rows
            .iter()
            .map(row_to_folder)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(account)
    }

    // -- sync mappings -------------------------------------------------------

    pub async fn create_mapping(&self, mapping: &NewSyncMapping) -> Result<SyncMapping, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_mappings
              (mailbox_account_id, mailbox_folder, calendar_account_id, calendar_url, calendar_name)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(mapping.mailbox_account_id)
        .bind(&mapping.mailbox_folder)
        .bind(mapping.calendar_account_id)
        .bind(&mapping.calendar_url)
        .bind(&mapping.calendar_name)
        .execute(&self.pool)
        .await?;

        let mapping_id = result.last_insert_rowid();
        self.get_mapping(mapping_id)
            .await?
            .ok_or_else(|| StoreError::Data(format!("mapping {mapping_id} vanished after insert")))
    }

    pub async fn update_mapping(
        &self,
        mapping_id: i64,
        calendar_url: Option<&str>,
        calendar_name: Option<&str>,
    ) -> Result<Option<SyncMapping>, StoreError> {
        let Some(mut mapping) = self.get_mapping(mapping_id).await? else {
            return Ok(None);
        };
        if let Some(url) = calendar_url {
            mapping.calendar_url = url.to_string();
        }
        if let Some(name) = calendar_name {
            mapping.calendar_name = Some(name.to_string());
        }

        sqlx::query("UPDATE sync_mappings SET calendar_url = ?1, calendar_name = ?2 WHERE id = ?3")
            .bind(&mapping.calendar_url)
            .bind(&mapping.calendar_name)
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(Some(mapping))
    }

    pub async fn delete_mapping(&self, mapping_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_mappings WHERE id = ?1")
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_mapping(&self, mapping_id: i64) -> Result<Option<SyncMapping>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_mappings WHERE id = ?1")
            .bind(mapping_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_mapping).transpose()
    }

    pub async fn list_mappings(&self) -> Result<Vec<SyncMapping>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_mappings ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_mapping).collect()
    }

    /// The mapping routing a mailbox folder to its calendar, if configured.
    pub async fn find_mapping_for_source(
        &self,
        mailbox_account_id: i64,
        folder: &str,
    ) -> Result<Option<SyncMapping>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sync_mappings WHERE mailbox_account_id = ?1 AND mailbox_folder = ?2 ORDER BY id LIMIT 1",
        )
        .bind(mailbox_account_id)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_mapping).transpose()
    }

    // -- tracked events ------------------------------------------------------

    pub async fn insert_event(&self, event: &TrackedEvent) -> Result<TrackedEvent, StoreError> {
        let history = serde_json::to_string(&event.history)?;
        let snapshot = event
            .sync_conflict_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO tracked_events (
              uid, mailbox_message_id, source_account_id, source_folder,
              summary, organizer, "start", "end", status, response_status,
              cancelled_by_organizer, payload, last_synced, history,
              caldav_etag, local_version, synced_version, remote_last_modified,
              local_last_modified, last_modified_source, sync_conflict,
              sync_conflict_reason, sync_conflict_snapshot, tracking_disabled,
              mail_error, created_at, updated_at
            ) VALUES (
              ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
              ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
            )
            "#,
        )
        .bind(&event.uid)
        .bind(&event.mailbox_message_id)
        .bind(event.source_account_id)
        .bind(&event.source_folder)
        .bind(&event.summary)
        .bind(&event.organizer)
        .bind(event.start.map(|value| value.to_rfc3339()))
        .bind(event.end.map(|value| value.to_rfc3339()))
        .bind(event.status.as_str())
        .bind(event.response_status.as_str())
        .bind(event.cancelled_by_organizer)
        .bind(&event.payload)
        .bind(event.last_synced.map(|value| value.to_rfc3339()))
        .bind(history)
        .bind(&event.caldav_etag)
        .bind(event.local_version)
        .bind(event.synced_version)
        .bind(event.remote_last_modified.map(|value| value.to_rfc3339()))
        .bind(event.local_last_modified.map(|value| value.to_rfc3339()))
        .bind(event.last_modified_source.map(|value| value.as_str()))
        .bind(event.sync_conflict)
        .bind(&event.sync_conflict_reason)
        .bind(snapshot)
        .bind(event.tracking_disabled)
        .bind(&event.mail_error)
        .bind(event.created_at.to_rfc3339())
        .bind(event.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let event_id = result.last_insert_rowid();
        self.get_event(event_id)
            .await?
            .ok_or_else(|| StoreError::Data(format!("event {event_id} vanished after insert")))
    }

    pub async fn update_event(&self, event: &TrackedEvent) -> Result<(), StoreError> {
        let history = serde_json::to_string(&event.history)?;
        let snapshot = event
            .sync_conflict_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE tracked_events SET
              mailbox_message_id = ?1, source_account_id = ?2, source_folder = ?3,
              summary = ?4, organizer = ?5, "start" = ?6, "end" = ?7, status = ?8,
              response_status = ?9, cancelled_by_organizer = ?10, payload = ?11,
              last_synced = ?12, history = ?13, caldav_etag = ?14,
              local_version = ?15, synced_version = ?16, remote_last_modified = ?17,
              local_last_modified = ?18, last_modified_source = ?19,
              sync_conflict = ?20, sync_conflict_reason = ?21,
              sync_conflict_snapshot = ?22, tracking_disabled = ?23,
              mail_error = ?24, updated_at = ?25
            WHERE id = ?26
            "#,
        )
        .bind(&event.mailbox_message_id)
        .bind(event.source_account_id)
        .bind(&event.source_folder)
        .bind(&event.summary)
        .bind(&event.organizer)
        .bind(event.start.map(|value| value.to_rfc3339()))
        .bind(event.end.map(|value| value.to_rfc3339()))
        .bind(event.status.as_str())
        .bind(event.response_status.as_str())
        .bind(event.cancelled_by_organizer)
        .bind(&event.payload)
        .bind(event.last_synced.map(|value| value.to_rfc3339()))
        .bind(history)
        .bind(&event.caldav_etag)
        .bind(event.local_version)
        .bind(event.synced_version)
        .bind(event.remote_last_modified.map(|value| value.to_rfc3339()))
        .bind(event.local_last_modified.map(|value| value.to_rfc3339()))
        .bind(event.last_modified_source.map(|value| value.as_str()))
        .bind(event.sync_conflict)
        .bind(&event.sync_conflict_reason)
        .bind(snapshot)
        .bind(event.tracking_disabled)
        .bind(&event.mail_error)
        .bind(Utc::now().to_rfc3339())
        .bind(event.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_event(&self, event_id: i64) -> Result<Option<TrackedEvent>, StoreError> {
        let row = sqlx::query("SELECT * FROM tracked_events WHERE id = ?1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row_to_event(&row)).transpose()?.map(|(event, _)| event))
    }

    pub async fn find_event_by_uid(&self, uid: &str) -> Result<Option<TrackedEvent>, StoreError> {
        let row = sqlx::query("SELECT * FROM tracked_events WHERE uid = ?1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row_to_event(&row)).transpose()?.map(|(event, _)| event))
    }

    /// All events visible in listings. Legacy history blobs are coerced into
    /// the canonical shape and written back in one pass.
    pub async fn list_events(&self) -> Result<Vec<TrackedEvent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tracked_events WHERE tracking_disabled = 0 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        let mut rewrites: Vec<(i64, Vec<HistoryEntry>)> = Vec::new();
        for row in &rows {
            let (event, history_changed) = row_to_event(row)?;
            if history_changed {
                rewrites.push((event.id, event.history.clone()));
            }
            events.push(event);
        }

        if !rewrites.is_empty() {
            let mut tx = self.pool.begin().await?;
            for (event_id, history) in &rewrites {
                sqlx::query("UPDATE tracked_events SET history = ?1 WHERE id = ?2")
                    .bind(serde_json::to_string(history)?)
                    .bind(event_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }

        Ok(events)
    }

    /// Fetch events by id, preserving the requested order.
    pub async fn events_by_ids(&self, ids: &[i64]) -> Result<Vec<TrackedEvent>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=ids.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT * FROM tracked_events WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut by_id = std::collections::HashMap::new();
        for row in &rows {
            let (event, _) = row_to_event(row)?;
            by_id.insert(event.id, event);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Events eligible for sync-all under a mapping: pending or
    /// organizer-side cancellations, never conflicted or untracked rows.
    pub async fn sync_candidates(
        &self,
        mailbox_account_id: i64,
        folder: &str,
    ) -> Result<Vec<TrackedEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tracked_events
            WHERE source_account_id = ?1
              AND source_folder = ?2
              AND (
                status IN ('new', 'updated')
                OR (
                  status = 'cancelled'
                  AND (cancelled_by_organizer IS NULL OR cancelled_by_organizer = 1)
                )
              )
              AND sync_conflict = 0
              AND tracking_disabled = 0
            ORDER BY id
            "#,
        )
        .bind(mailbox_account_id)
        .bind(folder)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row_to_event(row).map(|(event, _)| event))
            .collect()
    }

    // -- ignored mail imports ------------------------------------------------

    pub async fn add_ignored_mail_import(
        &self,
        import: &IgnoredMailImport,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ignored_mail_imports (uid, account_id, folder, message_id, max_uid)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&import.uid)
        .bind(import.account_id)
        .bind(&import.folder)
        .bind(&import.message_id)
        .bind(import.max_uid)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn ignored_mail_imports_for_uid(
        &self,
        uid: &str,
    ) -> Result<Vec<IgnoredMailImport>, StoreError> {
        let rows = sqlx::query("SELECT * FROM ignored_mail_imports WHERE uid = ?1 ORDER BY id")
            .bind(uid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_ignored_import).collect()
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    let value = value?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn row_to_account(row: &SqliteRow) -> Result<Account, StoreError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = AccountKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::Data(format!("unknown account kind: {kind_raw}")))?;
    let settings_raw: String = row.try_get("settings")?;

    Ok(Account {
        id: row.try_get("id")?,
        label: row.try_get("label")?,
        kind,
        settings: serde_json::from_str(&settings_raw)?,
        folders: Vec::new(),
        created_at: parse_timestamp(row.try_get("created_at")?).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(row.try_get("updated_at")?).unwrap_or_else(Utc::now),
    })
}

fn row_to_folder(row: &SqliteRow) -> Result<MailboxFolder, StoreError> {
    Ok(MailboxFolder {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        name: row.try_get("name")?,
        include_subfolders: row.try_get("include_subfolders")?,
    })
}

fn row_to_mapping(row: &SqliteRow) -> Result<SyncMapping, StoreError> {
    Ok(SyncMapping {
        id: row.try_get("id")?,
        mailbox_account_id: row.try_get("mailbox_account_id")?,
        mailbox_folder: row.try_get("mailbox_folder")?,
        calendar_account_id: row.try_get("calendar_account_id")?,
        calendar_url: row.try_get("calendar_url")?,
        calendar_name: row.try_get("calendar_name")?,
    })
}

fn row_to_ignored_import(row: &SqliteRow) -> Result<IgnoredMailImport, StoreError> {
    Ok(IgnoredMailImport {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        account_id: row.try_get("account_id")?,
        folder: row.try_get("folder")?,
        message_id: row.try_get("message_id")?,
        max_uid: row.try_get("max_uid")?,
    })
}

/// Map a row into a TrackedEvent. The second value reports whether the stored
/// history needed normalization and should be written back.
fn row_to_event(row: &SqliteRow) -> Result<(TrackedEvent, bool), StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = EventStatus::parse(&status_raw).unwrap_or_else(|| {
        warn!("Unknown event status {status_raw}, treating as new");
        EventStatus::New
    });

    let response_raw: String = row.try_get("response_status")?;
    let response_status = ResponseStatus::parse(&response_raw).unwrap_or_default();

    let source_raw: Option<String> = row.try_get("last_modified_source")?;
    let last_modified_source = source_raw.as_deref().and_then(ModificationSource::parse);

    let history_raw: String = row.try_get("history")?;
    let history_value =
        serde_json::from_str::<Value>(&history_raw).unwrap_or(Value::String(history_raw));
    let (history, history_changed) = normalize_history(&history_value);

    let snapshot_raw: Option<String> = row.try_get("sync_conflict_snapshot")?;
    let sync_conflict_snapshot = snapshot_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());

    let event = TrackedEvent {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        mailbox_message_id: row.try_get("mailbox_message_id")?,
        source_account_id: row.try_get("source_account_id")?,
        source_folder: row.try_get("source_folder")?,
        summary: row.try_get("summary")?,
        organizer: row.try_get("organizer")?,
        start: parse_timestamp(row.try_get("start")?),
        end: parse_timestamp(row.try_get("end")?),
        status,
        response_status,
        cancelled_by_organizer: row.try_get("cancelled_by_organizer")?,
        payload: row.try_get("payload")?,
        last_synced: parse_timestamp(row.try_get("last_synced")?),
        history,
        caldav_etag: row.try_get("caldav_etag")?,
        local_version: row.try_get("local_version")?,
        synced_version: row.try_get("synced_version")?,
        remote_last_modified: parse_timestamp(row.try_get("remote_last_modified")?),
        local_last_modified: parse_timestamp(row.try_get("local_last_modified")?),
        last_modified_source,
        sync_conflict: row.try_get("sync_conflict")?,
        sync_conflict_reason: row.try_get("sync_conflict_reason")?,
        sync_conflict_snapshot,
        tracking_disabled: row.try_get("tracking_disabled")?,
        mail_error: row.try_get("mail_error")?,
        created_at: parse_timestamp(row.try_get("created_at")?).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(row.try_get("updated_at")?).unwrap_or_else(Utc::now),
    };

    Ok((event, history_changed))
}
