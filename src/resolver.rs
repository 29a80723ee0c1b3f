use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument};

use crate::models::{Group, Lesson, LessonRecord, Place, Subject, Teacher};
use crate::reconcile::canonical_group_number;

/// Decides when two names refer to the same real-world entity.
pub trait NameKey: Send + Sync {
    /// Key under which a teacher, subject or place name is deduplicated.
    fn key(&self, name: &str) -> String;
}

/// Names are equal only when identical after trimming.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatch;

impl NameKey for ExactMatch {
    fn key(&self, name: &str) -> String {
        name.trim().to_string()
    }
}

/// Import-local registry of one entity kind; ids run from 1 in first-seen order.
#[derive(Debug, Default)]
struct Registry {
    ids: HashMap<String, i64>,
    entries: Vec<(i64, String, String)>,
}

impl Registry {
    fn insert(&mut self, key: String, display: &str) {
        if key.is_empty() || self.ids.contains_key(&key) {
            return;
        }
        let id = self.entries.len() as i64 + 1;
        self.ids.insert(key.clone(), id);
        self.entries.push((id, key, display.trim().to_string()));
    }

    fn get(&self, key: &str) -> Option<i64> {
        self.ids.get(key).copied()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Deduplicated teachers, groups, subjects and places of a whole batch.
pub struct EntitySets<'k> {
    key: &'k dyn NameKey,
    teachers: Registry,
    groups: Registry,
    subjects: Registry,
    places: Registry,
}

impl<'k> EntitySets<'k> {
    /// Must see every record of the batch: the same entity shows up on many
    /// pages and has to collapse to one row.
    pub fn collect(records: &[LessonRecord], key: &'k dyn NameKey) -> Self {
        let mut sets = Self {
            key,
            teachers: Registry::default(),
            groups: Registry::default(),
            subjects: Registry::default(),
            places: Registry::default(),
        };

        for record in records {
            sets.subjects.insert(key.key(&record.subject), &record.subject);
            for name in &record.teachers {
                sets.teachers.insert(key.key(name), name);
            }
            for name in &record.places {
                sets.places.insert(key.key(name), name);
            }
            for raw in &record.groups {
                sets.groups.insert(canonical_group_number(raw), raw);
            }
        }

        debug!(
            teachers = sets.teachers.len(),
            groups = sets.groups.len(),
            subjects = sets.subjects.len(),
            places = sets.places.len(),
            "Entity sets collected"
        );

        sets
    }

    pub fn teacher_id(&self, name: &str) -> Option<i64> {
        self.teachers.get(&self.key.key(name))
    }

    pub fn subject_id(&self, name: &str) -> Option<i64> {
        self.subjects.get(&self.key.key(name))
    }

    pub fn place_id(&self, name: &str) -> Option<i64> {
        self.places.get(&self.key.key(name))
    }

    /// Looks the group up by its canonical number, exactly as it was registered.
    pub fn group_id(&self, raw: &str) -> Option<i64> {
        self.groups.get(&canonical_group_number(raw))
    }

    pub fn teachers(&self) -> Vec<Teacher> {
        self.teachers
            .entries
            .iter()
            .map(|(id, _, name)| Teacher {
                id: *id,
                name: name.clone(),
            })
            .collect()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.groups
            .entries
            .iter()
            .map(|(id, number, name)| Group {
                id: *id,
                number: number.clone(),
                name: name.clone(),
            })
            .collect()
    }

    pub fn subjects(&self) -> Vec<Subject> {
        self.subjects
            .entries
            .iter()
            .map(|(id, _, name)| Subject {
                id: *id,
                name: name.clone(),
            })
            .collect()
    }

    pub fn places(&self) -> Vec<Place> {
        self.places
            .entries
            .iter()
            .map(|(id, _, name)| Place {
                id: *id,
                name: name.clone(),
            })
            .collect()
    }
}

/// A complete schedule dataset ready to replace the stored one.
#[derive(Debug, Default, Clone)]
pub struct Generation {
    pub teachers: Vec<Teacher>,
    pub groups: Vec<Group>,
    pub subjects: Vec<Subject>,
    pub places: Vec<Place>,
    pub lessons: Vec<Lesson>,
    /// `(lesson_id, teacher_id)` edges.
    pub lesson_teachers: Vec<(i64, i64)>,
    pub lesson_groups: Vec<(i64, i64)>,
    pub lesson_places: Vec<(i64, i64)>,
    /// References (including a lesson's subject) that matched no entity.
    pub skipped_references: usize,
}

impl Generation {
    pub fn build(records: &[LessonRecord], key: &dyn NameKey) -> Self {
        let sets = EntitySets::collect(records, key);
        Self::assemble(records, &sets)
    }

    /// Create lessons and their association edges. References that do not
    /// resolve are skipped; repeated edges of one lesson are dropped.
    #[instrument(skip_all, fields(record_count = records.len()))]
    pub fn assemble(records: &[LessonRecord], sets: &EntitySets<'_>) -> Self {
        let mut generation = Generation {
            teachers: sets.teachers(),
            groups: sets.groups(),
            subjects: sets.subjects(),
            places: sets.places(),
            ..Generation::default()
        };

        for record in records {
            let Some(subject_id) = sets.subject_id(&record.subject) else {
                debug!(subject = %record.subject, "Unresolved subject, skipping lesson");
                generation.skipped_references += 1;
                continue;
            };

            let lesson_id = generation.lessons.len() as i64 + 1;
            let (odd_week, even_week) = record.parity.flags();
            generation.lessons.push(Lesson {
                id: lesson_id,
                subject_id,
                weekday: record.weekday,
                number: record.period,
                start_time: record.time.as_ref().map(|t| t.start.clone()),
                end_time: record.time.as_ref().map(|t| t.end.clone()),
                odd_week,
                even_week,
            });

            generation.skipped_references += link(
                lesson_id,
                record.teachers.iter().map(|name| sets.teacher_id(name)),
                &mut generation.lesson_teachers,
            );
            generation.skipped_references += link(
                lesson_id,
                record.groups.iter().map(|raw| sets.group_id(raw)),
                &mut generation.lesson_groups,
            );
            generation.skipped_references += link(
                lesson_id,
                record.places.iter().map(|name| sets.place_id(name)),
                &mut generation.lesson_places,
            );
        }

        generation
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty()
    }
}

/// Push deduplicated edges for one lesson; returns how many references
/// failed to resolve.
fn link(
    lesson_id: i64,
    ids: impl Iterator<Item = Option<i64>>,
    edges: &mut Vec<(i64, i64)>,
) -> usize {
    let mut seen = HashSet::new();
    let mut unresolved = 0;
    for id in ids {
        match id {
            Some(id) => {
                if seen.insert(id) {
                    edges.push((lesson_id, id));
                }
            }
            None => unresolved += 1,
        }
    }
    unresolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Parity;

    fn record(subject: &str, teachers: &[&str], groups: &[&str], places: &[&str]) -> LessonRecord {
        LessonRecord {
            subject: subject.to_string(),
            teachers: teachers.iter().map(|s| s.to_string()).collect(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            places: places.iter().map(|s| s.to_string()).collect(),
            weekday: 0,
            period: 1,
            time: None,
            parity: Parity::Both,
        }
    }

    #[test]
    fn test_entities_deduplicated_across_records() {
        let records = vec![
            record("Матанализ", &["Иванов И.И."], &["101"], &["ауд.305"]),
            record("Физика", &["Иванов И.И.", "Петров П.П."], &["101", "102"], &["ауд.305"]),
            record("Матанализ", &[" Иванов И.И. "], &["102"], &["ЦФА"]),
        ];

        let generation = Generation::build(&records, &ExactMatch);

        let teachers: Vec<&str> = generation.teachers.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(teachers, vec!["Иванов И.И.", "Петров П.П."]);
        assert_eq!(generation.subjects.len(), 2);
        assert_eq!(generation.places.len(), 2);
        assert_eq!(generation.groups.len(), 2);
        assert_eq!(generation.lessons.len(), 3);

        let ids: Vec<i64> = generation.teachers.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_group_reconciliation_consistent_between_set_and_edges() {
        let records = vec![record("Оптика", &[], &["141МПТ(1)", "141МП"], &[])];

        let generation = Generation::build(&records, &ExactMatch);

        assert_eq!(generation.groups.len(), 1);
        assert_eq!(generation.groups[0].number, "141МП");
        assert_eq!(generation.groups[0].name, "141МПТ(1)");
        assert_eq!(generation.lesson_groups, vec![(1, 1)]);
        assert_eq!(generation.skipped_references, 0);
    }

    #[test]
    fn test_duplicate_edges_dropped() {
        let records = vec![record(
            "Оптика",
            &["Иванов И.И.", "Иванов И.И. "],
            &["101", " 101"],
            &["ауд.1", "ауд.1"],
        )];

        let generation = Generation::build(&records, &ExactMatch);

        assert_eq!(generation.lesson_teachers, vec![(1, 1)]);
        assert_eq!(generation.lesson_groups, vec![(1, 1)]);
        assert_eq!(generation.lesson_places, vec![(1, 1)]);
    }

    #[test]
    fn test_unresolved_references_skipped() {
        let known = vec![record("Оптика", &["Иванов И.И."], &["101"], &[])];
        let sets = EntitySets::collect(&known, &ExactMatch);

        let records = vec![
            record("Оптика", &["Иванов И.И.", "Сидоров С.С."], &["101", "999"], &["ауд.1"]),
            record("Химия", &["Иванов И.И."], &["101"], &[]),
        ];
        let generation = Generation::assemble(&records, &sets);

        // The first lesson survives with its resolvable edges only.
        assert_eq!(generation.lessons.len(), 1);
        assert_eq!(generation.lesson_teachers, vec![(1, 1)]);
        assert_eq!(generation.lesson_groups, vec![(1, 1)]);
        assert!(generation.lesson_places.is_empty());
        // Сидоров, 999, ауд.1 and the unknown subject Химия.
        assert_eq!(generation.skipped_references, 4);
    }

    #[test]
    fn test_lessons_without_groups_still_assembled() {
        let records = vec![record("Физкультура", &[], &[], &[])];
        let generation = Generation::build(&records, &ExactMatch);

        assert_eq!(generation.lessons.len(), 1);
        assert!(generation.lesson_groups.is_empty());
        assert!(generation.lesson_teachers.is_empty());
    }

    struct CaseInsensitive;

    impl NameKey for CaseInsensitive {
        fn key(&self, name: &str) -> String {
            name.trim().to_lowercase()
        }
    }

    #[test]
    fn test_name_key_is_pluggable() {
        let records = vec![
            record("Оптика", &["Иванов И.И."], &[], &[]),
            record("оптика", &["ИВАНОВ И.И."], &[], &[]),
        ];

        assert_eq!(Generation::build(&records, &ExactMatch).subjects.len(), 2);

        let generation = Generation::build(&records, &CaseInsensitive);
        assert_eq!(generation.subjects.len(), 1);
        assert_eq!(generation.teachers.len(), 1);
        assert_eq!(generation.teachers[0].name, "Иванов И.И.");
        assert_eq!(generation.lesson_teachers, vec![(1, 1), (2, 1)]);
    }
}
