use crate::error::StoreError;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::info;

pub(crate) const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  label TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('mailbox', 'calendar')),
  settings TEXT NOT NULL,
  created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

pub(crate) const CREATE_MAILBOX_FOLDERS: &str = r#"
CREATE TABLE IF NOT EXISTS mailbox_folders (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  include_subfolders INTEGER NOT NULL DEFAULT 1
)
"#;

pub(crate) const CREATE_SYNC_MAPPINGS: &str = r#"
CREATE TABLE IF NOT EXISTS sync_mappings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  mailbox_account_id INTEGER NOT NULL REFERENCES accounts(id),
  mailbox_folder TEXT NOT NULL,
  calendar_account_id INTEGER NOT NULL REFERENCES accounts(id),
  calendar_url TEXT NOT NULL,
  calendar_name TEXT
)
"#;

pub(crate) const CREATE_TRACKED_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS tracked_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uid TEXT NOT NULL UNIQUE,
  mailbox_message_id TEXT,
  source_account_id INTEGER REFERENCES accounts(id),
  source_folder TEXT,
  summary TEXT,
  organizer TEXT,
  "start" TEXT,
  "end" TEXT,
  status TEXT NOT NULL DEFAULT 'new'
    CHECK (status IN ('new', 'updated', 'cancelled', 'synced', 'failed')),
  response_status TEXT NOT NULL DEFAULT 'none',
  cancelled_by_organizer INTEGER,
  payload TEXT,
  last_synced TEXT,
  history TEXT NOT NULL DEFAULT '[]',
  caldav_etag TEXT,
  local_version INTEGER NOT NULL DEFAULT 0,
  synced_version INTEGER NOT NULL DEFAULT 0,
  remote_last_modified TEXT,
  local_last_modified TEXT,
  last_modified_source TEXT,
  sync_conflict INTEGER NOT NULL DEFAULT 0,
  sync_conflict_reason TEXT,
  sync_conflict_snapshot TEXT,
  tracking_disabled INTEGER NOT NULL DEFAULT 0,
  mail_error TEXT,
  created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

pub(crate) const CREATE_IGNORED_MAIL_IMPORTS: &str = r#"
CREATE TABLE IF NOT EXISTS ignored_mail_imports (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uid TEXT NOT NULL,
  account_id INTEGER,
  folder TEXT,
  message_id TEXT,
  max_uid INTEGER
)
"#;

/// Column order used when rebuilding tracked_events; every name must exist in
/// both the old and the new table once the additive upgrades ran.
const TRACKED_EVENT_COLUMNS: &[&str] = &[
    "id",
    "uid",
    "mailbox_message_id",
    "source_account_id",
    "source_folder",
    "summary",
    "organizer",
    "start",
    "end",
    "status",
    "response_status",
    "cancelled_by_organizer",
    "payload",
    "last_synced",
    "history",
    "caldav_etag",
    "local_version",
    "synced_version",
    "remote_last_modified",
    "local_last_modified",
    "last_modified_source",
    "sync_conflict",
    "sync_conflict_reason",
    "sync_conflict_snapshot",
    "tracking_disabled",
    "mail_error",
    "created_at",
    "updated_at",
];

pub(crate) async fn ensure_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    for ddl in [
        CREATE_ACCOUNTS,
        CREATE_MAILBOX_FOLDERS,
        CREATE_SYNC_MAPPINGS,
        CREATE_TRACKED_EVENTS,
        CREATE_IGNORED_MAIL_IMPORTS,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<HashSet<String>, StoreError> {
    let rows = sqlx::query(&format!("PRAGMA table_info('{table}')"))
        .fetch_all(pool)
        .await?;
    let mut columns = HashSet::new();
    for row in rows {
        columns.insert(row.try_get::<String, _>("name")?);
    }
    Ok(columns)
}

async fn table_definition(pool: &SqlitePool, table: &str) -> Result<Option<String>, StoreError> {
    let row = sqlx::query("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1")
        .bind(table)
        .fetch_optional(pool)
        .await?;
    Ok(match row {
        Some(row) => row.try_get::<Option<String>, _>("sql")?,
        None => None,
    })
}

/// Lightweight in-app schema migrations for SQLite deployments.
///
/// Each step is an idempotent check plus DDL: missing columns are added with
/// safe defaults, and widening the status enum rebuilds the table via
/// rename-create-copy-drop because SQLite cannot swap a CHECK constraint in
/// place.
pub(crate) async fn apply_schema_upgrades(pool: &SqlitePool) -> Result<(), StoreError> {
    let columns = table_columns(pool, "tracked_events").await?;
    if columns.is_empty() {
        // Table does not exist yet; ensure_schema creates it in final form.
        return Ok(());
    }
    let definition = table_definition(pool, "tracked_events").await?;

    if !columns.contains("response_status") {
        info!("Adding response_status column to tracked_events table");
        sqlx::query(
            "ALTER TABLE tracked_events ADD COLUMN response_status TEXT NOT NULL DEFAULT 'none'",
        )
        .execute(pool)
        .await?;
    }

    let mut added_timestamp_column = false;

    // SQLite rejects non-constant defaults in ALTER TABLE, so the timestamp
    // columns are added bare and backfilled below.
    if !columns.contains("created_at") {
        info!("Adding created_at column to tracked_events table");
        sqlx::query("ALTER TABLE tracked_events ADD COLUMN created_at TEXT")
            .execute(pool)
            .await?;
        added_timestamp_column = true;
    }

    if !columns.contains("updated_at") {
        info!("Adding updated_at column to tracked_events table");
        sqlx::query("ALTER TABLE tracked_events ADD COLUMN updated_at TEXT")
            .execute(pool)
            .await?;
        added_timestamp_column = true;
    }

    if added_timestamp_column {
        info!("Backfilling timestamp metadata on existing tracked events");
        sqlx::query(
            r#"
            UPDATE tracked_events
            SET created_at = COALESCE(created_at, CURRENT_TIMESTAMP),
                updated_at = COALESCE(updated_at, created_at)
            "#,
        )
        .execute(pool)
        .await?;
    }

    if !columns.contains("cancelled_by_organizer") {
        info!("Adding cancelled_by_organizer column to tracked_events table");
        sqlx::query("ALTER TABLE tracked_events ADD COLUMN cancelled_by_organizer INTEGER")
            .execute(pool)
            .await?;
    }

    let new_columns: [(&str, &str); 11] = [
        (
            "caldav_etag",
            "ALTER TABLE tracked_events ADD COLUMN caldav_etag TEXT",
        ),
        (
            "local_version",
            "ALTER TABLE tracked_events ADD COLUMN local_version INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "synced_version",
            "ALTER TABLE tracked_events ADD COLUMN synced_version INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "remote_last_modified",
            "ALTER TABLE tracked_events ADD COLUMN remote_last_modified TEXT",
        ),
        (
            "local_last_modified",
            "ALTER TABLE tracked_events ADD COLUMN local_last_modified TEXT",
        ),
        (
            "last_modified_source",
            "ALTER TABLE tracked_events ADD COLUMN last_modified_source TEXT",
        ),
        (
            "sync_conflict",
            "ALTER TABLE tracked_events ADD COLUMN sync_conflict INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "sync_conflict_reason",
            "ALTER TABLE tracked_events ADD COLUMN sync_conflict_reason TEXT",
        ),
        (
            "sync_conflict_snapshot",
            "ALTER TABLE tracked_events ADD COLUMN sync_conflict_snapshot TEXT",
        ),
        (
            "tracking_disabled",
            "ALTER TABLE tracked_events ADD COLUMN tracking_disabled INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "mail_error",
            "ALTER TABLE tracked_events ADD COLUMN mail_error TEXT",
        ),
    ];

    for (column_name, ddl) in new_columns {
        if columns.contains(column_name) {
            continue;
        }
        info!("Adding {column_name} column to tracked_events table");
        sqlx::query(ddl).execute(pool).await?;
    }

    let ignored_mail_columns = table_columns(pool, "ignored_mail_imports").await?;
    if !ignored_mail_columns.is_empty() && !ignored_mail_columns.contains("max_uid") {
        info!("Adding max_uid column to ignored_mail_imports table");
        sqlx::query("ALTER TABLE ignored_mail_imports ADD COLUMN max_uid INTEGER")
            .execute(pool)
            .await?;
    }

    let needs_status_enum_upgrade = matches!(
        definition.as_deref(),
        Some(sql) if !sql.to_lowercase().contains("failed")
    );

    if needs_status_enum_upgrade {
        info!("Rebuilding tracked_events table to allow the failed status in enum constraint");
        rebuild_tracked_events(pool).await?;
    }

    Ok(())
}

async fn rebuild_tracked_events(pool: &SqlitePool) -> Result<(), StoreError> {
    let quoted = TRACKED_EVENT_COLUMNS
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");

    let mut tx = pool.begin().await?;
    sqlx::query("DROP TABLE IF EXISTS tracked_events_old")
        .execute(&mut *tx)
        .await?;
    sqlx::query("ALTER TABLE tracked_events RENAME TO tracked_events_old")
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_TRACKED_EVENTS).execute(&mut *tx).await?;
    sqlx::query(&format!(
        "INSERT INTO tracked_events ({quoted}) SELECT {quoted} FROM tracked_events_old"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query("DROP TABLE tracked_events_old")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
