//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            slug            TEXT    NOT NULL UNIQUE,
            name            TEXT    NOT NULL,
            has_changed     INTEGER NOT NULL DEFAULT 0,
            sync_disabled   INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS locales (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            code    TEXT NOT NULL UNIQUE,
            name    TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS repositories (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id  INTEGER NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
            url         TEXT    NOT NULL,
            branch      TEXT    NOT NULL DEFAULT 'main',
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_repositories_project ON repositories (project_id);

        CREATE TABLE IF NOT EXISTS repository_locales (
            repository_id   INTEGER NOT NULL REFERENCES repositories (id) ON DELETE CASCADE,
            locale_id       INTEGER NOT NULL REFERENCES locales (id) ON DELETE CASCADE,
            PRIMARY KEY (repository_id, locale_id)
        );

        CREATE TABLE IF NOT EXISTS resources (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id  INTEGER NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
            path        TEXT    NOT NULL,
            UNIQUE (project_id, path)
        );

        CREATE TABLE IF NOT EXISTS entities (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_id     INTEGER NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
            key             TEXT    NOT NULL,
            string          TEXT    NOT NULL,
            string_plural   TEXT    NOT NULL DEFAULT '',
            obsolete        INTEGER NOT NULL DEFAULT 0,
            date_created    TEXT    NOT NULL,
            UNIQUE (resource_id, key)
        );

        CREATE TABLE IF NOT EXISTS translations (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id       INTEGER NOT NULL REFERENCES entities (id) ON DELETE CASCADE,
            locale_id       INTEGER NOT NULL REFERENCES locales (id) ON DELETE CASCADE,
            plural_form     INTEGER,
            string          TEXT    NOT NULL,
            approved        INTEGER NOT NULL DEFAULT 0,
            approved_date   TEXT,
            date            TEXT    NOT NULL,
            user            TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_translations_entity_locale
            ON translations (entity_id, locale_id);

        CREATE TABLE IF NOT EXISTS changed_entity_locale (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id   INTEGER NOT NULL REFERENCES entities (id) ON DELETE CASCADE,
            locale_id   INTEGER NOT NULL REFERENCES locales (id) ON DELETE CASCADE,
            changed_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_changed_entity_locale_locale
            ON changed_entity_locale (locale_id, changed_at);

        CREATE TABLE IF NOT EXISTS sync_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            start_time  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS project_sync_logs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            sync_log_id         INTEGER NOT NULL REFERENCES sync_logs (id),
            project_id          INTEGER NOT NULL REFERENCES projects (id),
            start_time          TEXT    NOT NULL,
            skipped             INTEGER NOT NULL DEFAULT 0,
            skipped_end_time    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_project_sync_logs_sync_log
            ON project_sync_logs (sync_log_id);

        CREATE TABLE IF NOT EXISTS repository_sync_logs (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            project_sync_log_id     INTEGER NOT NULL REFERENCES project_sync_logs (id),
            repository_id           INTEGER NOT NULL REFERENCES repositories (id),
            start_time              TEXT    NOT NULL,
            end_time                TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_repository_sync_logs_project_sync_log
            ON repository_sync_logs (project_sync_log_id);
        "#,
    ),
    (
        2,
        "translation statistics",
        r#"
        CREATE TABLE IF NOT EXISTS translated_resources (
            resource_id         INTEGER NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
            locale_id           INTEGER NOT NULL REFERENCES locales (id) ON DELETE CASCADE,
            total_strings       INTEGER NOT NULL DEFAULT 0,
            approved_strings    INTEGER NOT NULL DEFAULT 0,
            translated_strings  INTEGER NOT NULL DEFAULT 0,
            updated_at          TEXT    NOT NULL,
            PRIMARY KEY (resource_id, locale_id)
        );

        CREATE TABLE IF NOT EXISTS project_locales (
            project_id          INTEGER NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
            locale_id           INTEGER NOT NULL REFERENCES locales (id) ON DELETE CASCADE,
            total_strings       INTEGER NOT NULL DEFAULT 0,
            approved_strings    INTEGER NOT NULL DEFAULT 0,
            translated_strings  INTEGER NOT NULL DEFAULT 0,
            updated_at          TEXT    NOT NULL,
            PRIMARY KEY (project_id, locale_id)
        );
        "#,
    ),
    (
        3,
        "shared task locks",
        r#"
        CREATE TABLE IF NOT EXISTS task_locks (
            lock_key    TEXT PRIMARY KEY,
            holder      TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        4,
        "synced working-tree values",
        r#"
        CREATE TABLE IF NOT EXISTS synced_values (
            entity_id   INTEGER NOT NULL REFERENCES entities (id) ON DELETE CASCADE,
            locale_id   INTEGER NOT NULL REFERENCES locales (id) ON DELETE CASCADE,
            value       TEXT,
            synced_at   TEXT    NOT NULL,
            PRIMARY KEY (entity_id, locale_id)
        );
        "#,
    ),
    (
        5,
        "persistent task queue",
        r#"
        CREATE TABLE IF NOT EXISTS task_queue (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id  TEXT    NOT NULL UNIQUE,
            task        TEXT    NOT NULL,
            enqueued_at TEXT    NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
