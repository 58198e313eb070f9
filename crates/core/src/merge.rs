//! Merge Step: resolve differences between the database and the working
//! tree into one-directional edits.
//!
//! [`sync_resources`] is the project-wide companion run by the Coordinator:
//! it brings resources and entities in line with the source locale.
//! [`update_translations`] runs per locale inside the Worker's transaction
//! and fills a [`Changeset`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::changeset::Changeset;
use crate::db::store::{self, NewTranslation};
use crate::errors::DatabaseError;
use crate::models::{Entity, Locale, Translation};
use crate::vcs::{VcsEdit, VcsResource, VcsValue};

/// Outcome of [`sync_resources`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSyncSummary {
    pub resources_created: usize,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub entities_obsoleted: usize,
}

/// Outcome of [`update_translations`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Entities whose database strings are written to the working tree.
    pub database_wins: usize,
    /// Entities whose working-tree strings are applied to the database.
    pub working_tree_wins: usize,
    /// Entities left for the next run: changed in the database after the
    /// reference time.
    pub deferred: usize,
}

fn source_strings(value: &VcsValue) -> (String, String) {
    match value {
        VcsValue::Single(s) => (s.clone(), String::new()),
        VcsValue::Plural(forms) => (
            forms.first().cloned().unwrap_or_default(),
            forms.get(1).cloned().unwrap_or_default(),
        ),
    }
}

/// Align the project's resources and entities with `sources`, the union of
/// every checkout's source locale. Does nothing when `sources` is empty.
pub fn sync_resources(
    conn: &Connection,
    project_id: i64,
    sources: &BTreeMap<String, VcsResource>,
    now: &DateTime<Utc>,
) -> Result<ResourceSyncSummary, DatabaseError> {
    let mut summary = ResourceSyncSummary::default();
    if sources.is_empty() {
        debug!(project_id, "no source resources found, leaving entities untouched");
        return Ok(summary);
    }

    let mut obsolete = Vec::new();
    for resource in store::list_resources(conn, project_id)? {
        if !sources.contains_key(&resource.path) {
            obsolete.extend(
                store::list_resource_entities(conn, resource.id)?
                    .into_iter()
                    .filter(|e| !e.obsolete)
                    .map(|e| e.id),
            );
        }
    }

    for (path, source) in sources {
        let resource_id = match store::find_resource(conn, project_id, path)? {
            Some(id) => id,
            None => {
                summary.resources_created += 1;
                store::insert_resource(conn, project_id, path)?
            }
        };

        let mut existing: HashMap<String, Entity> = store::list_resource_entities(conn, resource_id)?
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();

        for (key, value) in &source.entries {
            let (string, plural) = source_strings(value);
            match existing.remove(key) {
                Some(entity) => {
                    if entity.obsolete || entity.string != string || entity.string_plural != plural {
                        store::update_entity(conn, entity.id, &string, &plural)?;
                        summary.entities_updated += 1;
                    }
                }
                None => {
                    store::insert_entity(conn, resource_id, key, &string, &plural, now)?;
                    summary.entities_created += 1;
                }
            }
        }

        obsolete.extend(existing.into_values().filter(|e| !e.obsolete).map(|e| e.id));
    }

    summary.entities_obsoleted = store::mark_entities_obsolete(conn, &obsolete)?;
    debug!(
        project_id,
        resources_created = summary.resources_created,
        entities_created = summary.entities_created,
        entities_updated = summary.entities_updated,
        entities_obsoleted = summary.entities_obsoleted,
        "resources synced"
    );
    Ok(summary)
}

/// Database view of one entity in one locale.
#[derive(Debug, Clone, PartialEq)]
enum Approved {
    Nothing,
    Value(VcsValue),
    /// Plural forms are missing and the working tree cannot supply them.
    Incomplete,
}

impl Approved {
    fn into_value(self) -> Option<VcsValue> {
        match self {
            Self::Value(value) => Some(value),
            Self::Nothing | Self::Incomplete => None,
        }
    }
}

/// Whether `t` is part of the database view as of `now`.
fn approved_by(t: &Translation, now: &DateTime<Utc>) -> bool {
    t.approved && t.approved_date.map_or(true, |date| date <= *now)
}

/// Approved database strings of one entity as of `now`: the latest
/// approval per plural form. A plural form with no approval takes the
/// working tree's string at the same index.
fn approved_value(
    translations: &[&Translation],
    now: &DateTime<Utc>,
    tree: Option<&VcsValue>,
) -> Approved {
    let mut latest: BTreeMap<Option<i64>, &Translation> = BTreeMap::new();
    for &t in translations.iter().filter(|t| approved_by(t, now)) {
        let slot = latest.entry(t.plural_form).or_insert(t);
        if t.approved_date > slot.approved_date {
            *slot = t;
        }
    }

    if let Some(single) = latest.get(&None) {
        return Approved::Value(VcsValue::Single(single.string.clone()));
    }
    let Some(last) = latest.keys().filter_map(|form| *form).max() else {
        return Approved::Nothing;
    };

    let tree_forms = match tree {
        Some(VcsValue::Plural(forms)) => forms.as_slice(),
        _ => &[],
    };
    let mut forms = Vec::new();
    for form in 0..=last {
        let string = match latest.get(&Some(form)) {
            Some(t) => t.string.clone(),
            None => match usize::try_from(form).ok().and_then(|i| tree_forms.get(i)) {
                Some(string) => string.clone(),
                None => return Approved::Incomplete,
            },
        };
        forms.push(string);
    }
    Approved::Value(VcsValue::Plural(forms))
}

/// Compute the edits of `changeset.project_id()` in `locale`.
///
/// Only entities of resources present in `source_paths` (the repository's
/// source resources) are considered, and entities changed in the database
/// after `changeset.now()` wait for the next run. `vcs_locale` is the
/// repository's copy of the locale.
///
/// A key counts as changed in the working tree when it differs from the
/// value recorded at the previous sync; with no record, only an unmarked
/// entity counts as changed there. Direction:
/// - changed in the working tree only: the working tree wins;
/// - changed in the database only (marked, or differing from an unchanged
///   working tree): the database wins;
/// - changed on both sides: the newer side wins, the file modification time
///   against the marker; ties go to the database.
pub fn update_translations(
    conn: &Connection,
    changeset: &mut Changeset,
    locale: &Locale,
    source_paths: &BTreeSet<String>,
    vcs_locale: &BTreeMap<String, VcsResource>,
) -> Result<MergeSummary, DatabaseError> {
    let project_id = changeset.project_id();
    let now = changeset.now();
    let markers = store::dirty_markers_until(conn, project_id, locale.id, &now)?;
    let pending = store::entities_changed_after(conn, project_id, locale.id, &now)?;
    let synced = store::synced_values(conn, project_id, locale.id)?;

    let translations = store::list_locale_translations(conn, project_id, locale.id)?;
    let mut by_entity: HashMap<i64, Vec<&Translation>> = HashMap::new();
    for t in &translations {
        by_entity.entry(t.entity_id).or_default().push(t);
    }

    let mut summary = MergeSummary::default();
    for (path, entity) in store::list_project_entities(conn, project_id)? {
        if !source_paths.contains(&path) {
            continue;
        }
        if pending.contains(&entity.id) {
            debug!(entity = entity.id, locale = %locale.code, "entity changed after reference time, deferred");
            summary.deferred += 1;
            continue;
        }

        let entity_translations = by_entity.get(&entity.id).map(Vec::as_slice).unwrap_or(&[]);
        let file = vcs_locale.get(&path);
        let vcs_value = file.and_then(|f| f.entries.get(&entity.key));
        let db_value = match approved_value(entity_translations, &now, vcs_value) {
            Approved::Incomplete => {
                warn!(
                    entity = entity.id,
                    locale = %locale.code,
                    "approved plural forms are incomplete, entity skipped"
                );
                continue;
            }
            approved => approved.into_value(),
        };
        let last_synced = synced.get(&entity.id);

        if db_value.as_ref() == vcs_value {
            if file.is_some() && last_synced.map(Option::as_ref) != Some(vcs_value) {
                changeset.record_synced_value(entity.id, vcs_value.cloned(), None);
            }
            continue;
        }

        let marker = markers.get(&entity.id);
        let database_wins = match (file, marker) {
            (None, None) => continue,
            (None, Some(_)) => true,
            (Some(file), marker) => {
                let tree_changed = match last_synced {
                    Some(previous) => previous.as_ref() != vcs_value,
                    None => marker.is_none(),
                };
                match marker {
                    _ if !tree_changed => true,
                    None => false,
                    Some(changed_at) => !(file.last_modified > *changed_at && vcs_value.is_some()),
                }
            }
        };

        if database_wins {
            let edit = match &db_value {
                Some(value) => VcsEdit::Set(value.clone()),
                None => VcsEdit::Remove,
            };
            let authors = entity_translations
                .iter()
                .filter(|t| approved_by(t, &now))
                .filter_map(|t| t.user.clone());
            changeset.update_vcs_entity(&locale.code, &path, &entity.key, edit, authors);
            changeset.record_synced_value(entity.id, vcs_value.cloned(), Some(db_value));
            summary.database_wins += 1;
        } else {
            apply_working_tree(changeset, &entity, locale, entity_translations, vcs_value);
            changeset.record_synced_value(entity.id, vcs_value.cloned(), None);
            summary.working_tree_wins += 1;
        }
    }

    debug!(
        project_id,
        locale = %locale.code,
        database_wins = summary.database_wins,
        working_tree_wins = summary.working_tree_wins,
        deferred = summary.deferred,
        "translations merged"
    );
    Ok(summary)
}

/// Make the working-tree strings the approved ones for `entity`.
fn apply_working_tree(
    changeset: &mut Changeset,
    entity: &Entity,
    locale: &Locale,
    translations: &[&Translation],
    vcs_value: Option<&VcsValue>,
) {
    let forms = vcs_value.map(VcsValue::forms).unwrap_or_default();

    for (plural_form, string) in &forms {
        let existing = translations
            .iter()
            .find(|t| t.plural_form == *plural_form && t.string == *string);
        match existing {
            Some(t) if t.approved => {}
            Some(t) => changeset.approve_translation(t.id),
            None => changeset.create_translation(NewTranslation {
                entity_id: entity.id,
                locale_id: locale.id,
                plural_form: *plural_form,
                string: string.to_string(),
                approved: true,
                user: None,
            }),
        }
    }

    let now = changeset.now();
    for t in translations.iter().filter(|t| approved_by(t, &now)) {
        let kept = forms
            .iter()
            .any(|(form, string)| t.plural_form == *form && t.string == *string);
        if !kept {
            changeset.reject_translation(t.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{now, Database};
    use chrono::{DateTime, Duration, Utc};

    fn resource(path: &str, entries: &[(&str, VcsValue)], modified: DateTime<Utc>) -> VcsResource {
        VcsResource {
            path: path.into(),
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            last_modified: modified,
        }
    }

    fn single(s: &str) -> VcsValue {
        VcsValue::Single(s.into())
    }

    struct Fixture {
        db: Database,
        project_id: i64,
        locale: Locale,
        entity_id: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let project = db.create_project("firefox", "Firefox").unwrap();
        let locale = db.create_locale("fr", "French").unwrap();
        let resource_id = db.create_resource(project.id, "main.json").unwrap();
        let entity_id = db.create_entity(resource_id, "title", "Title").unwrap();
        Fixture {
            db,
            project_id: project.id,
            locale,
            entity_id,
        }
    }

    fn merge(f: &Fixture, at: DateTime<Utc>, files: &[VcsResource]) -> (Changeset, MergeSummary) {
        let sources = BTreeSet::from(["main.json".to_string()]);
        let vcs_locale: BTreeMap<String, VcsResource> =
            files.iter().map(|r| (r.path.clone(), r.clone())).collect();
        let mut changeset = Changeset::new(f.project_id, at);
        let summary = f
            .db
            .transaction(|conn| update_translations(conn, &mut changeset, &f.locale, &sources, &vcs_locale))
            .unwrap();
        (changeset, summary)
    }

    fn mark(f: &Fixture, at: DateTime<Utc>) {
        f.db.transaction(|conn| store::mark_entity_changed(conn, f.entity_id, f.locale.id, &at))
            .unwrap();
    }

    fn record_synced(f: &Fixture, value: Option<VcsValue>) {
        f.db.transaction(|conn| {
            store::upsert_synced_value(conn, f.entity_id, f.locale.id, value.as_ref(), &now())
        })
        .unwrap();
    }

    #[test]
    fn test_sync_resources_lifecycle() {
        let f = fixture();
        let at = now();
        let sources = BTreeMap::from([
            (
                "main.json".to_string(),
                resource(
                    "main.json",
                    &[
                        ("title", single("Title v2")),
                        ("items", VcsValue::Plural(vec!["item".into(), "items".into()])),
                    ],
                    at,
                ),
            ),
            ("menu.json".to_string(), resource("menu.json", &[("open", single("Open"))], at)),
        ]);

        let summary = f
            .db
            .transaction(|conn| sync_resources(conn, f.project_id, &sources, &at))
            .unwrap();
        assert_eq!(
            summary,
            ResourceSyncSummary {
                resources_created: 1,
                entities_created: 2,
                entities_updated: 1,
                entities_obsoleted: 0,
            }
        );

        let entities = f
            .db
            .transaction(|conn| store::list_project_entities(conn, f.project_id))
            .unwrap();
        let items = entities.iter().find(|(_, e)| e.key == "items").unwrap();
        assert_eq!(items.1.string, "item");
        assert_eq!(items.1.string_plural, "items");

        // menu.json disappears; its entity goes obsolete.
        let only_main: BTreeMap<_, _> = sources.into_iter().filter(|(p, _)| p == "main.json").collect();
        let summary = f
            .db
            .transaction(|conn| sync_resources(conn, f.project_id, &only_main, &at))
            .unwrap();
        assert_eq!(summary.entities_obsoleted, 1);
        assert_eq!(summary.entities_updated, 0);
    }

    #[test]
    fn test_sync_resources_ignores_empty_sources() {
        let f = fixture();
        let summary = f
            .db
            .transaction(|conn| sync_resources(conn, f.project_id, &BTreeMap::new(), &now()))
            .unwrap();
        assert_eq!(summary, ResourceSyncSummary::default());
        let entities = f
            .db
            .transaction(|conn| store::list_project_entities(conn, f.project_id))
            .unwrap();
        assert_eq!(entities.len(), 1);
    }

    #[test]
    fn test_unmarked_working_tree_change_is_imported() {
        let f = fixture();
        let old = f
            .db
            .insert_translation(f.entity_id, f.locale.id, None, "Vieux", Some(now() - Duration::hours(1)), None)
            .unwrap();
        let at = now();
        let (changeset, summary) = merge(&f, at, &[resource("main.json", &[("title", single("Titre"))], at)]);
        assert_eq!(summary.working_tree_wins, 1);
        assert!(changeset.locales_to_commit().is_empty());

        f.db.transaction(|conn| changeset.execute(conn)).unwrap();
        let rows = f.db.list_translations(f.entity_id, f.locale.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, old);
        assert!(!rows[0].approved);
        assert_eq!(rows[1].string, "Titre");
        assert_eq!(rows[1].approved_date, Some(at));
    }

    #[test]
    fn test_existing_suggestion_is_approved() {
        let f = fixture();
        let suggestion = f
            .db
            .insert_translation(f.entity_id, f.locale.id, None, "Titre", None, None)
            .unwrap();
        let at = now();
        let (changeset, _) = merge(&f, at, &[resource("main.json", &[("title", single("Titre"))], at)]);
        f.db.transaction(|conn| changeset.execute(conn)).unwrap();

        let rows = f.db.list_translations(f.entity_id, f.locale.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, suggestion);
        assert!(rows[0].approved);
    }

    #[test]
    fn test_marked_change_is_written_back() {
        let f = fixture();
        let changed_at = now() - Duration::minutes(10);
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(changed_at), Some("alice"))
            .unwrap();
        mark(&f, changed_at);

        let file_time = changed_at - Duration::minutes(5);
        let (changeset, summary) = merge(&f, now(), &[resource("main.json", &[("title", single("Vieux"))], file_time)]);
        assert_eq!(summary.database_wins, 1);
        assert_eq!(changeset.locales_to_commit(), BTreeSet::from(["fr"]));
        assert_eq!(changeset.commit_authors("fr"), vec!["alice"]);
        assert_eq!(
            changeset.vcs_edits("fr").unwrap()["main.json"]["title"],
            VcsEdit::Set(single("Titre"))
        );
    }

    #[test]
    fn test_newer_file_beats_marker() {
        let f = fixture();
        record_synced(&f, Some(single("Vieux")));
        let changed_at = now() - Duration::minutes(10);
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(changed_at), None)
            .unwrap();
        mark(&f, changed_at);

        let file_time = changed_at + Duration::minutes(5);
        let (changeset, summary) = merge(&f, now(), &[resource("main.json", &[("title", single("Nouveau"))], file_time)]);
        assert_eq!(summary.working_tree_wins, 1);
        assert!(changeset.locales_to_commit().is_empty());
    }

    #[test]
    fn test_older_file_loses_when_both_sides_changed() {
        let f = fixture();
        record_synced(&f, Some(single("Vieux")));
        let changed_at = now() - Duration::minutes(10);
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(changed_at), None)
            .unwrap();
        mark(&f, changed_at);

        let file_time = changed_at - Duration::minutes(5);
        let (_, summary) = merge(&f, now(), &[resource("main.json", &[("title", single("Nouveau"))], file_time)]);
        assert_eq!(summary.database_wins, 1);
    }

    #[test]
    fn test_unchanged_key_in_rewritten_file_keeps_database_edit() {
        let f = fixture();
        record_synced(&f, Some(single("Vieux")));
        let changed_at = now() - Duration::minutes(10);
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(changed_at), None)
            .unwrap();
        mark(&f, changed_at);

        // Another key of the file changed after the database edit.
        let (changeset, summary) = merge(
            &f,
            now(),
            &[resource(
                "main.json",
                &[("title", single("Vieux")), ("body", single("Corps"))],
                now(),
            )],
        );
        assert_eq!(summary.database_wins, 1);
        assert_eq!(
            changeset.vcs_edits("fr").unwrap()["main.json"]["title"],
            VcsEdit::Set(single("Titre"))
        );
    }

    #[test]
    fn test_fresh_checkout_keeps_marked_database_edit() {
        let f = fixture();
        let changed_at = now() - Duration::minutes(10);
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(changed_at), None)
            .unwrap();
        mark(&f, changed_at);

        // No value recorded yet and a file newer than the marker.
        let (_, summary) = merge(&f, now(), &[resource("main.json", &[("title", single("Vieux"))], now())]);
        assert_eq!(summary.database_wins, 1);
    }

    #[test]
    fn test_unmarked_database_change_wins_over_unchanged_tree() {
        let f = fixture();
        record_synced(&f, Some(single("Vieux")));
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(now() - Duration::minutes(1)), None)
            .unwrap();

        let (_, summary) = merge(&f, now(), &[resource("main.json", &[("title", single("Vieux"))], now())]);
        assert_eq!(summary.database_wins, 1);
    }

    #[test]
    fn test_marker_and_missing_key_removes_nothing_approved() {
        let f = fixture();
        let changed_at = now() - Duration::minutes(10);
        mark(&f, changed_at);
        // File is newer but lacks the key, and nothing is approved: the
        // database view (no translation) is already equal.
        let (changeset, summary) = merge(&f, now(), &[resource("main.json", &[], now())]);
        assert_eq!(summary, MergeSummary::default());
        assert!(changeset.is_empty());
    }

    #[test]
    fn test_entity_edited_after_reference_time_is_deferred() {
        let f = fixture();
        let at = now();
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(at - Duration::minutes(5)), None)
            .unwrap();
        // Submitted between the Coordinator's reference time and the merge.
        let late = at + Duration::minutes(1);
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Nouveau titre", Some(late), Some("alice"))
            .unwrap();
        mark(&f, late);

        let (changeset, summary) = merge(&f, at, &[resource("main.json", &[("title", single("Titre"))], at)]);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.working_tree_wins, 0);
        assert!(changeset.is_empty());
    }

    #[test]
    fn test_approval_after_reference_time_is_not_rejected() {
        let f = fixture();
        let at = now();
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(at - Duration::minutes(5)), None)
            .unwrap();
        let late = f
            .db
            .insert_translation(f.entity_id, f.locale.id, None, "Nouveau titre", Some(at + Duration::minutes(1)), None)
            .unwrap();

        let (changeset, summary) = merge(&f, at, &[resource("main.json", &[("title", single("Titre"))], at)]);
        assert_eq!(summary, MergeSummary::default());
        f.db.transaction(|conn| changeset.execute(conn)).unwrap();
        let rows = f.db.list_translations(f.entity_id, f.locale.id).unwrap();
        assert!(rows.iter().any(|t| t.id == late && t.approved));
    }

    #[test]
    fn test_no_file_and_no_marker_does_nothing() {
        let f = fixture();
        f.db.insert_translation(f.entity_id, f.locale.id, None, "Titre", Some(now()), None)
            .unwrap();
        let (changeset, summary) = merge(&f, now(), &[]);
        assert_eq!(summary, MergeSummary::default());
        assert!(changeset.is_empty());
    }

    #[test]
    fn test_plural_values() {
        let f = fixture();
        let at = now();
        f.db.insert_translation(f.entity_id, f.locale.id, Some(0), "un", Some(at), None).unwrap();
        f.db.insert_translation(f.entity_id, f.locale.id, Some(1), "des", Some(at), None).unwrap();
        let plural = VcsValue::Plural(vec!["un".into(), "des".into()]);

        let (changeset, summary) = merge(&f, at, &[resource("main.json", &[("title", plural)], at)]);
        assert_eq!(summary, MergeSummary::default());
        assert!(changeset.is_empty());
    }

    #[test]
    fn test_sparse_plural_forms_keep_their_index() {
        let f = fixture();
        let changed_at = now() - Duration::minutes(10);
        f.db.insert_translation(f.entity_id, f.locale.id, Some(0), "un", Some(changed_at), None).unwrap();
        f.db.insert_translation(f.entity_id, f.locale.id, Some(2), "beaucoup", Some(changed_at), None).unwrap();
        mark(&f, changed_at);

        let tree = VcsValue::Plural(vec!["un".into(), "deux".into(), "plusieurs".into()]);
        let (changeset, summary) = merge(&f, now(), &[resource("main.json", &[("title", tree)], changed_at)]);
        assert_eq!(summary.database_wins, 1);
        assert_eq!(
            changeset.vcs_edits("fr").unwrap()["main.json"]["title"],
            VcsEdit::Set(VcsValue::Plural(vec!["un".into(), "deux".into(), "beaucoup".into()]))
        );
    }

    #[test]
    fn test_unfillable_plural_gap_is_skipped() {
        let f = fixture();
        let changed_at = now() - Duration::minutes(10);
        f.db.insert_translation(f.entity_id, f.locale.id, Some(0), "un", Some(changed_at), None).unwrap();
        f.db.insert_translation(f.entity_id, f.locale.id, Some(2), "beaucoup", Some(changed_at), None).unwrap();
        mark(&f, changed_at);

        let (changeset, summary) = merge(&f, now(), &[resource("main.json", &[], changed_at)]);
        assert_eq!(summary, MergeSummary::default());
        assert!(changeset.is_empty());
    }
}
