//! Transaction-scoped statements.
//!
//! Every function here takes the `&Connection` handed out by
//! [`Database::transaction`](super::Database::transaction) so that the
//! merge, the changeset, the dirty-marker cleanup and the duplicate-approval
//! cleanup of one locale commit or roll back together.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{fmt_ts, opt_ts_column, ts_column};
use crate::errors::DatabaseError;
use crate::models::{Entity, Resource, Translation};
use crate::vcs::VcsValue;

/// A translation to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTranslation {
    pub entity_id: i64,
    pub locale_id: i64,
    pub plural_form: Option<i64>,
    pub string: String,
    pub approved: bool,
    pub user: Option<String>,
}

pub(crate) const TRANSLATION_COLUMNS: &str =
    "t.id, t.entity_id, t.locale_id, t.plural_form, t.string, t.approved, t.approved_date, t.date, t.user";

pub(crate) fn translation_from_row(row: &Row<'_>) -> rusqlite::Result<Translation> {
    Ok(Translation {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        locale_id: row.get(2)?,
        plural_form: row.get(3)?,
        string: row.get(4)?,
        approved: row.get(5)?,
        approved_date: opt_ts_column(row, 6)?,
        date: ts_column(row, 7)?,
        user: row.get(8)?,
    })
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        resource_id: row.get(1)?,
        key: row.get(2)?,
        string: row.get(3)?,
        string_plural: row.get(4)?,
        obsolete: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Translations
// ---------------------------------------------------------------------------

/// Insert a translation dated `date`. Approved translations get
/// `approved_date = date`.
pub fn insert_translation(
    conn: &Connection,
    translation: &NewTranslation,
    date: &DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let stamp = fmt_ts(date);
    let approved_date = translation.approved.then(|| stamp.clone());
    conn.execute(
        "INSERT INTO translations (entity_id, locale_id, plural_form, string, approved,
         approved_date, date, user)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            translation.entity_id,
            translation.locale_id,
            translation.plural_form,
            translation.string,
            translation.approved,
            approved_date,
            stamp,
            translation.user,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Approve the given translations as of `at`.
pub fn approve_translations(
    conn: &Connection,
    ids: &[i64],
    at: &DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let stamp = fmt_ts(at);
    let mut stmt = conn.prepare_cached(
        "UPDATE translations SET approved = 1, approved_date = ?1 WHERE id = ?2",
    )?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![stamp, id])?;
    }
    Ok(changed)
}

/// Clear the approval flag and date of the given translations.
pub fn reject_translations(conn: &Connection, ids: &[i64]) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "UPDATE translations SET approved = 0, approved_date = NULL WHERE id = ?1",
    )?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![id])?;
    }
    Ok(changed)
}

/// All translations of a project's entities into one locale.
pub fn list_locale_translations(
    conn: &Connection,
    project_id: i64,
    locale_id: i64,
) -> Result<Vec<Translation>, DatabaseError> {
    let sql = format!(
        "SELECT {TRANSLATION_COLUMNS}
         FROM translations t
         JOIN entities e ON e.id = t.entity_id
         JOIN resources r ON r.id = e.resource_id
         WHERE r.project_id = ?1 AND t.locale_id = ?2
         ORDER BY t.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![project_id, locale_id], translation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Demote duplicate approvals of a project in one locale.
///
/// Within each group of translations sharing the entity, the locale and the
/// plural form (rows without a plural form match every group of their
/// entity), every translation whose approval date differs from the group's
/// latest approval date loses its approval. Translations without an
/// approval date are left alone.
pub fn demote_duplicate_approvals(
    conn: &Connection,
    project_id: i64,
    locale_id: i64,
) -> Result<usize, DatabaseError> {
    let demoted = conn.execute(
        "UPDATE translations
         SET approved = 0, approved_date = NULL
         WHERE id IN (
             SELECT t.id FROM translations t
             JOIN entities e ON e.id = t.entity_id
             JOIN resources r ON r.id = e.resource_id
             WHERE t.locale_id = ?1 AND r.project_id = ?2)
           AND approved_date != (
             SELECT MAX(m.approved_date) FROM translations m
             WHERE m.entity_id = translations.entity_id
               AND m.locale_id = translations.locale_id
               AND (m.plural_form = translations.plural_form OR m.plural_form IS NULL))",
        params![locale_id, project_id],
    )?;
    debug!(project_id, locale_id, demoted, "demoted duplicate approvals");
    Ok(demoted)
}

// ---------------------------------------------------------------------------
// Dirty markers
// ---------------------------------------------------------------------------

/// Record a database-side change of `entity_id` in `locale_id` and flag
/// the owning project as changed.
pub fn mark_entity_changed(
    conn: &Connection,
    entity_id: i64,
    locale_id: i64,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO changed_entity_locale (entity_id, locale_id, changed_at)
         VALUES (?1, ?2, ?3)",
        params![entity_id, locale_id, fmt_ts(at)],
    )?;
    conn.execute(
        "UPDATE projects SET has_changed = 1
         WHERE id = (SELECT r.project_id FROM entities e
                     JOIN resources r ON r.id = e.resource_id
                     WHERE e.id = ?1)",
        params![entity_id],
    )?;
    Ok(())
}

/// Latest marker time per entity for a project and locale, considering
/// only markers at or before `until`.
pub fn dirty_markers_until(
    conn: &Connection,
    project_id: i64,
    locale_id: i64,
    until: &DateTime<Utc>,
) -> Result<HashMap<i64, DateTime<Utc>>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT c.entity_id, MAX(c.changed_at)
         FROM changed_entity_locale c
         JOIN entities e ON e.id = c.entity_id
         JOIN resources r ON r.id = e.resource_id
         WHERE r.project_id = ?1 AND c.locale_id = ?2 AND c.changed_at <= ?3
         GROUP BY c.entity_id",
    )?;
    let markers = stmt
        .query_map(params![project_id, locale_id, fmt_ts(until)], |row| {
            Ok((row.get::<_, i64>(0)?, ts_column(row, 1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(markers)
}

/// Entities of a project with a marker in one locale later than `after`.
/// Their database strings are still moving, so the merge leaves them for
/// the next run.
pub fn entities_changed_after(
    conn: &Connection,
    project_id: i64,
    locale_id: i64,
    after: &DateTime<Utc>,
) -> Result<HashSet<i64>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.entity_id
         FROM changed_entity_locale c
         JOIN entities e ON e.id = c.entity_id
         JOIN resources r ON r.id = e.resource_id
         WHERE r.project_id = ?1 AND c.locale_id = ?2 AND c.changed_at > ?3",
    )?;
    let ids = stmt
        .query_map(params![project_id, locale_id, fmt_ts(after)], |row| row.get(0))?
        .collect::<Result<HashSet<i64>, _>>()?;
    Ok(ids)
}

/// Delete a project's markers for one locale up to and including `until`.
pub fn delete_dirty_markers(
    conn: &Connection,
    project_id: i64,
    locale_id: i64,
    until: &DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM changed_entity_locale
         WHERE locale_id = ?1 AND changed_at <= ?2
           AND entity_id IN (SELECT e.id FROM entities e
                             JOIN resources r ON r.id = e.resource_id
                             WHERE r.project_id = ?3)",
        params![locale_id, fmt_ts(until), project_id],
    )?;
    debug!(project_id, locale_id, deleted, "deleted dirty markers");
    Ok(deleted)
}

/// Clear the project's dirty flag unless markers remain anywhere in the
/// project. Returns whether the project is clean afterwards.
pub fn clear_project_dirty(conn: &Connection, project_id: i64) -> Result<bool, DatabaseError> {
    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM changed_entity_locale c
         JOIN entities e ON e.id = c.entity_id
         JOIN resources r ON r.id = e.resource_id
         WHERE r.project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )?;
    if remaining > 0 {
        debug!(project_id, remaining, "project keeps its dirty flag");
        return Ok(false);
    }
    conn.execute(
        "UPDATE projects SET has_changed = 0 WHERE id = ?1",
        params![project_id],
    )?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Synced working-tree values
// ---------------------------------------------------------------------------

/// The working-tree value of every entity of a project in one locale as of
/// its last sync. `None` records a key that was absent from the file.
pub fn synced_values(
    conn: &Connection,
    project_id: i64,
    locale_id: i64,
) -> Result<HashMap<i64, Option<VcsValue>>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT s.entity_id, s.value
         FROM synced_values s
         JOIN entities e ON e.id = s.entity_id
         JOIN resources r ON r.id = e.resource_id
         WHERE r.project_id = ?1 AND s.locale_id = ?2",
    )?;
    let rows = stmt
        .query_map(params![project_id, locale_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut values = HashMap::with_capacity(rows.len());
    for (entity_id, raw) in rows {
        let value = raw
            .map(|json| serde_json::from_str::<VcsValue>(&json))
            .transpose()
            .map_err(|e| DatabaseError::InvalidValue {
                column: "synced_values.value".into(),
                detail: e.to_string(),
            })?;
        values.insert(entity_id, value);
    }
    Ok(values)
}

/// Record the working-tree value of `entity_id` in `locale_id`.
pub fn upsert_synced_value(
    conn: &Connection,
    entity_id: i64,
    locale_id: i64,
    value: Option<&VcsValue>,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let json = value
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::InvalidValue {
            column: "synced_values.value".into(),
            detail: e.to_string(),
        })?;
    conn.execute(
        "INSERT INTO synced_values (entity_id, locale_id, value, synced_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (entity_id, locale_id) DO UPDATE SET
            value = excluded.value,
            synced_at = excluded.synced_at",
        params![entity_id, locale_id, json, fmt_ts(at)],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Resources and entities
// ---------------------------------------------------------------------------

pub fn list_resources(conn: &Connection, project_id: i64) -> Result<Vec<Resource>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT id, project_id, path FROM resources WHERE project_id = ?1 ORDER BY path")?;
    let rows = stmt
        .query_map(params![project_id], |row| {
            Ok(Resource {
                id: row.get(0)?,
                project_id: row.get(1)?,
                path: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_resource(conn: &Connection, project_id: i64, path: &str) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO resources (project_id, path) VALUES (?1, ?2)",
        params![project_id, path],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_resource(
    conn: &Connection,
    project_id: i64,
    path: &str,
) -> Result<Option<i64>, DatabaseError> {
    let id = conn
        .query_row(
            "SELECT id FROM resources WHERE project_id = ?1 AND path = ?2",
            params![project_id, path],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Entities of one resource, obsolete ones included.
pub fn list_resource_entities(
    conn: &Connection,
    resource_id: i64,
) -> Result<Vec<Entity>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, resource_id, key, string, string_plural, obsolete
         FROM entities WHERE resource_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![resource_id], entity_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Non-obsolete entities of a project, paired with their resource path.
pub fn list_project_entities(
    conn: &Connection,
    project_id: i64,
) -> Result<Vec<(String, Entity)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.resource_id, e.key, e.string, e.string_plural, e.obsolete, r.path
         FROM entities e
         JOIN resources r ON r.id = e.resource_id
         WHERE r.project_id = ?1 AND e.obsolete = 0
         ORDER BY r.path, e.id",
    )?;
    let rows = stmt
        .query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(6)?, entity_from_row(row)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_entity(
    conn: &Connection,
    resource_id: i64,
    key: &str,
    string: &str,
    string_plural: &str,
    at: &DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO entities (resource_id, key, string, string_plural, obsolete, date_created)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![resource_id, key, string, string_plural, fmt_ts(at)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Replace an entity's source strings and revive it if it was obsolete.
pub fn update_entity(
    conn: &Connection,
    entity_id: i64,
    string: &str,
    string_plural: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE entities SET string = ?1, string_plural = ?2, obsolete = 0 WHERE id = ?3",
        params![string, string_plural, entity_id],
    )?;
    Ok(())
}

pub fn mark_entities_obsolete(conn: &Connection, ids: &[i64]) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare_cached("UPDATE entities SET obsolete = 1 WHERE id = ?1")?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![id])?;
    }
    Ok(changed)
}
