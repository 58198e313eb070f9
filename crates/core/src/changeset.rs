//! Pending edits of one project at one reference time.
//!
//! The Merge Step fills a [`Changeset`] with database edits (translations to
//! create, approve or reject) and working-tree edits (keys to set or remove
//! per locale file). [`Changeset::execute`] applies the database edits on
//! the caller's transaction; the working-tree edits are read back by the
//! VCS backend during write-back. The working-tree value of every merged
//! entity is kept as well, so the next run can tell which keys changed in
//! the working tree since.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::db::store::{self, NewTranslation};
use crate::errors::DatabaseError;
use crate::vcs::{VcsEdit, VcsValue};

/// Working-tree edits of one locale: resource path, then key.
pub type LocaleEdits = BTreeMap<String, BTreeMap<String, VcsEdit>>;

/// Counts of database rows touched by [`Changeset::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangesetSummary {
    pub created: usize,
    pub approved: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct Changeset {
    project_id: i64,
    now: DateTime<Utc>,
    creates: Vec<NewTranslation>,
    approves: BTreeSet<i64>,
    rejects: BTreeSet<i64>,
    vcs_edits: BTreeMap<String, LocaleEdits>,
    authors: BTreeMap<String, BTreeSet<String>>,
    synced: BTreeMap<i64, SyncedValue>,
}

/// Working-tree value of one entity: as read, and as it will read once the
/// registered edits are written back.
#[derive(Debug, Clone, PartialEq)]
struct SyncedValue {
    current: Option<VcsValue>,
    written: Option<Option<VcsValue>>,
}

impl Changeset {
    pub fn new(project_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            project_id,
            now,
            creates: Vec::new(),
            approves: BTreeSet::new(),
            rejects: BTreeSet::new(),
            vcs_edits: BTreeMap::new(),
            authors: BTreeMap::new(),
            synced: BTreeMap::new(),
        }
    }

    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    /// Reference time used for approval dates.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn create_translation(&mut self, translation: NewTranslation) {
        self.creates.push(translation);
    }

    pub fn approve_translation(&mut self, id: i64) {
        self.rejects.remove(&id);
        self.approves.insert(id);
    }

    pub fn reject_translation(&mut self, id: i64) {
        self.approves.remove(&id);
        self.rejects.insert(id);
    }

    /// Register a working-tree edit of `key` in `locale`'s copy of
    /// `resource_path`, crediting `authors` in the commit.
    pub fn update_vcs_entity<I>(
        &mut self,
        locale: &str,
        resource_path: &str,
        key: &str,
        edit: VcsEdit,
        authors: I,
    ) where
        I: IntoIterator<Item = String>,
    {
        self.vcs_edits
            .entry(locale.to_string())
            .or_default()
            .entry(resource_path.to_string())
            .or_default()
            .insert(key.to_string(), edit);
        self.authors
            .entry(locale.to_string())
            .or_default()
            .extend(authors);
    }

    /// Remember the working-tree value of `entity_id`: `current` as read,
    /// `written` when a registered edit replaces it on write-back.
    pub fn record_synced_value(
        &mut self,
        entity_id: i64,
        current: Option<VcsValue>,
        written: Option<Option<VcsValue>>,
    ) {
        self.synced.insert(entity_id, SyncedValue { current, written });
    }

    /// Persist the recorded working-tree values for `locale_id`. With
    /// `written_back` the values after write-back are stored, otherwise the
    /// values as read.
    pub fn save_synced_values(
        &self,
        conn: &Connection,
        locale_id: i64,
        written_back: bool,
    ) -> Result<usize, DatabaseError> {
        for (entity_id, value) in &self.synced {
            let stored = match &value.written {
                Some(written) if written_back => written.as_ref(),
                _ => value.current.as_ref(),
            };
            store::upsert_synced_value(conn, *entity_id, locale_id, stored, &self.now)?;
        }
        Ok(self.synced.len())
    }

    /// Apply the database edits: rejections, then approvals, then inserts.
    pub fn execute(&self, conn: &Connection) -> Result<ChangesetSummary, DatabaseError> {
        let rejects: Vec<i64> = self.rejects.iter().copied().collect();
        let approves: Vec<i64> = self.approves.iter().copied().collect();

        let rejected = store::reject_translations(conn, &rejects)?;
        let approved = store::approve_translations(conn, &approves, &self.now)?;
        for translation in &self.creates {
            store::insert_translation(conn, translation, &self.now)?;
        }

        let summary = ChangesetSummary {
            created: self.creates.len(),
            approved,
            rejected,
        };
        debug!(
            project_id = self.project_id,
            created = summary.created,
            approved = summary.approved,
            rejected = summary.rejected,
            "changeset executed"
        );
        Ok(summary)
    }

    /// Locale codes with at least one working-tree edit.
    pub fn locales_to_commit(&self) -> BTreeSet<&str> {
        self.vcs_edits
            .iter()
            .filter(|(_, files)| files.values().any(|keys| !keys.is_empty()))
            .map(|(code, _)| code.as_str())
            .collect()
    }

    /// Working-tree edits registered for `locale`.
    pub fn vcs_edits(&self, locale: &str) -> Option<&LocaleEdits> {
        self.vcs_edits.get(locale)
    }

    /// Sorted, de-duplicated authors of the edits for `locale`.
    pub fn commit_authors(&self, locale: &str) -> Vec<String> {
        self.authors
            .get(locale)
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the changeset holds no database or working-tree edit.
    /// Recorded working-tree values do not count.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.approves.is_empty()
            && self.rejects.is_empty()
            && self.vcs_edits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now, Database};
    use crate::vcs::VcsValue;

    #[test]
    fn test_execute_applies_database_edits() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let project = db.create_project("firefox", "Firefox").unwrap();
        let locale = db.create_locale("fr", "French").unwrap();
        let resource = db.create_resource(project.id, "main.json").unwrap();
        let entity = db.create_entity(resource, "title", "Title").unwrap();
        let old = db
            .insert_translation(entity, locale.id, None, "Vieux", Some(now()), None)
            .unwrap();
        let suggestion = db
            .insert_translation(entity, locale.id, None, "Titre", None, None)
            .unwrap();

        let at = now();
        let mut changeset = Changeset::new(project.id, at);
        changeset.reject_translation(old);
        changeset.approve_translation(suggestion);
        changeset.create_translation(NewTranslation {
            entity_id: entity,
            locale_id: locale.id,
            plural_form: Some(1),
            string: "Titres".into(),
            approved: true,
            user: None,
        });
        assert!(!changeset.is_empty());

        let summary = db.transaction(|conn| changeset.execute(conn)).unwrap();
        assert_eq!(
            summary,
            ChangesetSummary {
                created: 1,
                approved: 1,
                rejected: 1
            }
        );

        let rows = db.list_translations(entity, locale.id).unwrap();
        assert!(!rows[0].approved && rows[0].approved_date.is_none());
        assert!(rows[1].approved);
        assert_eq!(rows[1].approved_date, Some(at));
        assert_eq!(rows[2].plural_form, Some(1));
        assert_eq!(rows[2].approved_date, Some(at));
    }

    #[test]
    fn test_approve_then_reject_keeps_last_decision() {
        let mut changeset = Changeset::new(1, now());
        changeset.approve_translation(5);
        changeset.reject_translation(5);
        assert!(changeset.approves.is_empty());
        assert!(changeset.rejects.contains(&5));
    }

    #[test]
    fn test_saved_values_follow_write_back() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let project = db.create_project("firefox", "Firefox").unwrap();
        let locale = db.create_locale("fr", "French").unwrap();
        let resource = db.create_resource(project.id, "main.json").unwrap();
        let title = db.create_entity(resource, "title", "Title").unwrap();
        let body = db.create_entity(resource, "body", "Body").unwrap();

        let mut changeset = Changeset::new(project.id, now());
        let vieux = VcsValue::Single("Vieux".into());
        let titre = VcsValue::Single("Titre".into());
        changeset.record_synced_value(title, Some(vieux.clone()), Some(Some(titre.clone())));
        changeset.record_synced_value(body, None, None);
        assert!(changeset.is_empty());

        let stored = |written_back| {
            db.transaction(|conn| {
                changeset.save_synced_values(conn, locale.id, written_back)?;
                store::synced_values(conn, project.id, locale.id)
            })
            .unwrap()
        };

        let values = stored(false);
        assert_eq!(values[&title], Some(vieux));
        assert_eq!(values[&body], None);

        let values = stored(true);
        assert_eq!(values[&title], Some(titre));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_vcs_edits_per_locale() {
        let mut changeset = Changeset::new(1, now());
        assert!(changeset.is_empty());
        changeset.update_vcs_entity(
            "fr",
            "main.json",
            "title",
            VcsEdit::Set(VcsValue::Single("Titre".into())),
            vec!["bob".to_string(), "alice".to_string()],
        );
        changeset.update_vcs_entity("fr", "main.json", "gone", VcsEdit::Remove, vec!["alice".to_string()]);

        assert_eq!(changeset.locales_to_commit(), BTreeSet::from(["fr"]));
        assert_eq!(changeset.commit_authors("fr"), vec!["alice", "bob"]);
        assert!(changeset.commit_authors("de").is_empty());
        let edits = changeset.vcs_edits("fr").unwrap();
        assert_eq!(edits["main.json"].len(), 2);
        assert!(changeset.vcs_edits("de").is_none());
    }
}
