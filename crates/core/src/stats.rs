//! Translation statistics recomputed after each locale's merge.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::changeset::Changeset;
use crate::db::fmt_ts;
use crate::errors::DatabaseError;
use crate::models::Locale;

/// Statistics collaborator, invoked inside the per-locale transaction.
pub trait StatsUpdater: Send + Sync {
    fn update_stats(
        &self,
        conn: &Connection,
        project_id: i64,
        changeset: &Changeset,
        locale: &Locale,
    ) -> Result<(), DatabaseError>;
}

/// Maintains `translated_resources` and `project_locales`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TranslatedResourceStats;

impl StatsUpdater for TranslatedResourceStats {
    fn update_stats(
        &self,
        conn: &Connection,
        project_id: i64,
        changeset: &Changeset,
        locale: &Locale,
    ) -> Result<(), DatabaseError> {
        let updated_at = fmt_ts(&changeset.now());

        conn.execute(
            "INSERT INTO translated_resources
                (resource_id, locale_id, total_strings, approved_strings, translated_strings, updated_at)
             SELECT r.id, ?2,
                (SELECT COUNT(*) FROM entities e
                 WHERE e.resource_id = r.id AND e.obsolete = 0),
                (SELECT COUNT(*) FROM entities e
                 WHERE e.resource_id = r.id AND e.obsolete = 0
                   AND EXISTS (SELECT 1 FROM translations t
                               WHERE t.entity_id = e.id AND t.locale_id = ?2 AND t.approved = 1)),
                (SELECT COUNT(*) FROM entities e
                 WHERE e.resource_id = r.id AND e.obsolete = 0
                   AND EXISTS (SELECT 1 FROM translations t
                               WHERE t.entity_id = e.id AND t.locale_id = ?2)),
                ?3
             FROM resources r
             WHERE r.project_id = ?1
             ON CONFLICT (resource_id, locale_id) DO UPDATE SET
                total_strings = excluded.total_strings,
                approved_strings = excluded.approved_strings,
                translated_strings = excluded.translated_strings,
                updated_at = excluded.updated_at",
            params![project_id, locale.id, updated_at],
        )?;

        conn.execute(
            "INSERT INTO project_locales
                (project_id, locale_id, total_strings, approved_strings, translated_strings, updated_at)
             SELECT ?1, ?2,
                COALESCE(SUM(tr.total_strings), 0),
                COALESCE(SUM(tr.approved_strings), 0),
                COALESCE(SUM(tr.translated_strings), 0),
                ?3
             FROM translated_resources tr
             JOIN resources r ON r.id = tr.resource_id
             WHERE r.project_id = ?1 AND tr.locale_id = ?2
             ON CONFLICT (project_id, locale_id) DO UPDATE SET
                total_strings = excluded.total_strings,
                approved_strings = excluded.approved_strings,
                translated_strings = excluded.translated_strings,
                updated_at = excluded.updated_at",
            params![project_id, locale.id, updated_at],
        )?;

        debug!(project_id, locale = %locale.code, "statistics updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now, Database};

    fn counters(db: &Database, project_id: i64, locale_id: i64) -> (i64, i64, i64) {
        db.conn()
            .query_row(
                "SELECT total_strings, approved_strings, translated_strings
                 FROM project_locales WHERE project_id = ?1 AND locale_id = ?2",
                params![project_id, locale_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap()
    }

    #[test]
    fn test_counts_per_locale() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let project = db.create_project("firefox", "Firefox").unwrap();
        let fr = db.create_locale("fr", "French").unwrap();
        let de = db.create_locale("de", "German").unwrap();
        let main = db.create_resource(project.id, "main.json").unwrap();
        let menu = db.create_resource(project.id, "menu.json").unwrap();
        let title = db.create_entity(main, "title", "Title").unwrap();
        let body = db.create_entity(main, "body", "Body").unwrap();
        db.create_entity(menu, "open", "Open").unwrap();

        db.insert_translation(title, fr.id, None, "Titre", Some(now()), None).unwrap();
        db.insert_translation(body, fr.id, None, "Corps", None, None).unwrap();
        db.insert_translation(body, de.id, None, "Körper", Some(now()), None).unwrap();

        let changeset = Changeset::new(project.id, now());
        db.transaction(|conn| TranslatedResourceStats.update_stats(conn, project.id, &changeset, &fr))
            .unwrap();
        assert_eq!(counters(&db, project.id, fr.id), (3, 1, 2));

        // Recomputing replaces the previous counters.
        db.insert_translation(body, fr.id, None, "Texte", Some(now()), None).unwrap();
        db.transaction(|conn| TranslatedResourceStats.update_stats(conn, project.id, &changeset, &fr))
            .unwrap();
        assert_eq!(counters(&db, project.id, fr.id), (3, 2, 2));

        let per_resource: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM translated_resources WHERE locale_id = ?1",
                params![fr.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(per_resource, 2);
    }
}
