//! Typed query helpers for the catalog tables and the Run Ledger.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::store::{self, NewTranslation, TRANSLATION_COLUMNS};
use super::{fmt_ts, now, opt_ts_column, ts_column, Database};
use crate::errors::DatabaseError;
use crate::models::{
    DirtyMarker, Locale, Project, ProjectSyncLog, ProjectSyncStatus, Repository,
    RepositorySyncLog, SyncLog, Translation,
};

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const PROJECT_COLUMNS: &str = "id, slug, name, has_changed, sync_disabled";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        has_changed: row.get(3)?,
        sync_disabled: row.get(4)?,
    })
}

fn project_sync_log_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectSyncLog> {
    Ok(ProjectSyncLog {
        id: row.get(0)?,
        sync_log_id: row.get(1)?,
        project_id: row.get(2)?,
        start_time: ts_column(row, 3)?,
        skipped: row.get(4)?,
        skipped_end_time: opt_ts_column(row, 5)?,
    })
}

fn repository_sync_log_from_row(row: &Row<'_>) -> rusqlite::Result<RepositorySyncLog> {
    Ok(RepositorySyncLog {
        id: row.get(0)?,
        project_sync_log_id: row.get(1)?,
        repository_id: row.get(2)?,
        start_time: ts_column(row, 3)?,
        end_time: opt_ts_column(row, 4)?,
    })
}

fn repository_locales(conn: &Connection, repository_id: i64) -> Result<Vec<Locale>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.code, l.name FROM locales l
         JOIN repository_locales rl ON rl.locale_id = l.id
         WHERE rl.repository_id = ?1
         ORDER BY l.code",
    )?;
    let locales = stmt
        .query_map(params![repository_id], |row| {
            Ok(Locale {
                id: row.get(0)?,
                code: row.get(1)?,
                name: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(locales)
}

fn load_repositories(
    conn: &Connection,
    sql: &str,
    id: i64,
) -> Result<Vec<Repository>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, project_id, url, branch)| {
            Ok(Repository {
                id,
                project_id,
                url,
                branch,
                locales: repository_locales(conn, id)?,
            })
        })
        .collect()
}

fn not_found(entity: &str, id: impl ToString) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.into(),
        id: id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- projects -----------------------------------------------------------

    pub fn create_project(&self, slug: &str, name: &str) -> Result<Project, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO projects (slug, name, created_at) VALUES (?1, ?2, ?3)",
            params![slug, name, fmt_ts(&now())],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, slug, "created project");
        Ok(Project {
            id,
            slug: slug.to_string(),
            name: name.to_string(),
            has_changed: false,
            sync_disabled: false,
        })
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>, DatabaseError> {
        let conn = self.conn();
        let project = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>, DatabaseError> {
        let conn = self.conn();
        let project = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE slug = ?1"),
                params![slug],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    /// List projects ordered by slug. Disabled projects are only included
    /// when `include_disabled` is set.
    pub fn list_projects(&self, include_disabled: bool) -> Result<Vec<Project>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects
             WHERE ?1 OR sync_disabled = 0 ORDER BY slug"
        ))?;
        let projects = stmt
            .query_map(params![include_disabled], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    pub fn set_project_sync_disabled(&self, id: i64, disabled: bool) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE projects SET sync_disabled = ?1 WHERE id = ?2",
            params![disabled, id],
        )?;
        if changed == 0 {
            return Err(not_found("project", id));
        }
        Ok(())
    }

    // -- locales ------------------------------------------------------------

    pub fn create_locale(&self, code: &str, name: &str) -> Result<Locale, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO locales (code, name) VALUES (?1, ?2)",
            params![code, name],
        )?;
        Ok(Locale {
            id: conn.last_insert_rowid(),
            code: code.to_string(),
            name: name.to_string(),
        })
    }

    pub fn get_locale_by_code(&self, code: &str) -> Result<Option<Locale>, DatabaseError> {
        let conn = self.conn();
        let locale = conn
            .query_row(
                "SELECT id, code, name FROM locales WHERE code = ?1",
                params![code],
                |row| {
                    Ok(Locale {
                        id: row.get(0)?,
                        code: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(locale)
    }

    // -- repositories -------------------------------------------------------

    /// Create a repository covering the locales with the given codes.
    pub fn create_repository(
        &self,
        project_id: i64,
        url: &str,
        branch: &str,
        locale_codes: &[&str],
    ) -> Result<Repository, DatabaseError> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO repositories (project_id, url, branch, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![project_id, url, branch, fmt_ts(&now())],
            )?;
            let id = conn.last_insert_rowid();
            for code in locale_codes {
                let changed = conn.execute(
                    "INSERT INTO repository_locales (repository_id, locale_id)
                     SELECT ?1, id FROM locales WHERE code = ?2",
                    params![id, code],
                )?;
                if changed == 0 {
                    return Err(not_found("locale", code));
                }
            }
            debug!(id, project_id, url, "created repository");
            Ok(Repository {
                id,
                project_id,
                url: url.to_string(),
                branch: branch.to_string(),
                locales: repository_locales(conn, id)?,
            })
        })
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>, DatabaseError> {
        let conn = self.conn();
        let mut repositories = load_repositories(
            &conn,
            "SELECT id, project_id, url, branch FROM repositories WHERE id = ?1",
            id,
        )?;
        Ok(repositories.pop())
    }

    pub fn list_repositories(&self, project_id: i64) -> Result<Vec<Repository>, DatabaseError> {
        let conn = self.conn();
        load_repositories(
            &conn,
            "SELECT id, project_id, url, branch FROM repositories
             WHERE project_id = ?1 ORDER BY id",
            project_id,
        )
    }

    // -- resources, entities, translations ----------------------------------

    pub fn create_resource(&self, project_id: i64, path: &str) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        store::insert_resource(&conn, project_id, path)
    }

    pub fn create_entity(&self, resource_id: i64, key: &str, string: &str) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        store::insert_entity(&conn, resource_id, key, string, "", &now())
    }

    /// Insert a translation directly, approved iff `approved_date` is set.
    /// No dirty marker is recorded; see [`Database::submit_translation`].
    pub fn insert_translation(
        &self,
        entity_id: i64,
        locale_id: i64,
        plural_form: Option<i64>,
        string: &str,
        approved_date: Option<DateTime<Utc>>,
        user: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO translations (entity_id, locale_id, plural_form, string, approved,
             approved_date, date, user)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entity_id,
                locale_id,
                plural_form,
                string,
                approved_date.is_some(),
                approved_date.as_ref().map(fmt_ts),
                fmt_ts(&approved_date.unwrap_or_else(now)),
                user,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record a translation made in the database: inserts it, leaves a dirty
    /// marker for (entity, locale) and flags the project, atomically.
    pub fn submit_translation(
        &self,
        translation: &NewTranslation,
        at: &DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        self.transaction(|conn| {
            let id = store::insert_translation(conn, translation, at)?;
            store::mark_entity_changed(conn, translation.entity_id, translation.locale_id, at)?;
            debug!(
                id,
                entity_id = translation.entity_id,
                locale_id = translation.locale_id,
                "submitted translation"
            );
            Ok(id)
        })
    }

    pub fn list_translations(
        &self,
        entity_id: i64,
        locale_id: i64,
    ) -> Result<Vec<Translation>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSLATION_COLUMNS} FROM translations t
             WHERE t.entity_id = ?1 AND t.locale_id = ?2 ORDER BY t.id"
        ))?;
        let rows = stmt
            .query_map(params![entity_id, locale_id], store::translation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_dirty_markers(&self, project_id: i64) -> Result<Vec<DirtyMarker>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.entity_id, c.locale_id, c.changed_at
             FROM changed_entity_locale c
             JOIN entities e ON e.id = c.entity_id
             JOIN resources r ON r.id = e.resource_id
             WHERE r.project_id = ?1
             ORDER BY c.id",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(DirtyMarker {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    locale_id: row.get(2)?,
                    changed_at: ts_column(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- run ledger ---------------------------------------------------------

    pub fn create_sync_log(&self, start_time: &DateTime<Utc>) -> Result<SyncLog, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_logs (start_time) VALUES (?1)",
            params![fmt_ts(start_time)],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, "created sync_log");
        Ok(SyncLog {
            id,
            start_time: *start_time,
        })
    }

    pub fn get_sync_log(&self, id: i64) -> Result<Option<SyncLog>, DatabaseError> {
        let conn = self.conn();
        let log = conn
            .query_row(
                "SELECT id, start_time FROM sync_logs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SyncLog {
                        id: row.get(0)?,
                        start_time: ts_column(row, 1)?,
                    })
                },
            )
            .optional()?;
        Ok(log)
    }

    pub fn create_project_sync_log(
        &self,
        sync_log_id: i64,
        project_id: i64,
        start_time: &DateTime<Utc>,
    ) -> Result<ProjectSyncLog, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO project_sync_logs (sync_log_id, project_id, start_time)
             VALUES (?1, ?2, ?3)",
            params![sync_log_id, project_id, fmt_ts(start_time)],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, sync_log_id, project_id, "created project_sync_log");
        Ok(ProjectSyncLog {
            id,
            sync_log_id,
            project_id,
            start_time: *start_time,
            skipped: false,
            skipped_end_time: None,
        })
    }

    pub fn get_project_sync_log(&self, id: i64) -> Result<Option<ProjectSyncLog>, DatabaseError> {
        let conn = self.conn();
        let log = conn
            .query_row(
                "SELECT id, sync_log_id, project_id, start_time, skipped, skipped_end_time
                 FROM project_sync_logs WHERE id = ?1",
                params![id],
                project_sync_log_from_row,
            )
            .optional()?;
        Ok(log)
    }

    pub fn list_project_sync_logs(&self, sync_log_id: i64) -> Result<Vec<ProjectSyncLog>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, sync_log_id, project_id, start_time, skipped, skipped_end_time
             FROM project_sync_logs WHERE sync_log_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![sync_log_id], project_sync_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Seal a project run record as skipped. Returns `false` if it was
    /// already skipped.
    pub fn mark_project_sync_skipped(
        &self,
        id: i64,
        at: &DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE project_sync_logs SET skipped = 1, skipped_end_time = ?1
             WHERE id = ?2 AND skipped = 0",
            params![fmt_ts(at), id],
        )?;
        if changed == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM project_sync_logs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(not_found("project_sync_log", id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    pub fn create_repository_sync_log(
        &self,
        project_sync_log_id: i64,
        repository_id: i64,
        start_time: &DateTime<Utc>,
    ) -> Result<RepositorySyncLog, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO repository_sync_logs (project_sync_log_id, repository_id, start_time)
             VALUES (?1, ?2, ?3)",
            params![project_sync_log_id, repository_id, fmt_ts(start_time)],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, project_sync_log_id, repository_id, "created repository_sync_log");
        Ok(RepositorySyncLog {
            id,
            project_sync_log_id,
            repository_id,
            start_time: *start_time,
            end_time: None,
        })
    }

    /// Seal a repository run record with its end time. Returns `false` if it
    /// already had one.
    pub fn finish_repository_sync_log(
        &self,
        id: i64,
        at: &DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE repository_sync_logs SET end_time = ?1 WHERE id = ?2 AND end_time IS NULL",
            params![fmt_ts(at), id],
        )?;
        if changed == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM repository_sync_logs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(not_found("repository_sync_log", id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    pub fn list_repository_sync_logs(
        &self,
        project_sync_log_id: i64,
    ) -> Result<Vec<RepositorySyncLog>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_sync_log_id, repository_id, start_time, end_time
             FROM repository_sync_logs WHERE project_sync_log_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_sync_log_id], repository_sync_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Derive the state of a project run record from its repository records.
    pub fn project_sync_status(&self, project_sync_log_id: i64) -> Result<ProjectSyncStatus, DatabaseError> {
        let log = self
            .get_project_sync_log(project_sync_log_id)?
            .ok_or_else(|| not_found("project_sync_log", project_sync_log_id))?;
        if log.skipped {
            return Ok(ProjectSyncStatus::Skipped);
        }

        let conn = self.conn();
        let (repositories, finished): (i64, i64) = conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM repositories WHERE project_id = ?1),
                (SELECT COUNT(DISTINCT repository_id) FROM repository_sync_logs
                 WHERE project_sync_log_id = ?2 AND end_time IS NOT NULL)",
            params![log.project_id, log.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if finished >= repositories {
            Ok(ProjectSyncStatus::Synced)
        } else {
            Ok(ProjectSyncStatus::InProgress)
        }
    }
}
