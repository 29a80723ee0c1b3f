use std::collections::BTreeSet;

use tracing::{info, instrument, warn};

use crate::models::{DataQuality, LessonRecord};
use crate::reconcile::{canonical_group_number, needs_reconciliation};

/// Count records that will be persisted with missing data and raw group
/// numbers that needed reconciliation. Nothing is rejected here.
#[instrument(skip(records), fields(record_count = records.len()))]
pub fn inspect(records: &[LessonRecord]) -> DataQuality {
    let overlong: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.groups.iter())
        .map(|g| g.trim())
        .filter(|g| needs_reconciliation(g))
        .collect();

    let quality = DataQuality {
        overlong_group_numbers: overlong.len(),
        records_without_groups: records.iter().filter(|r| r.groups.is_empty()).count(),
        records_without_teachers: records.iter().filter(|r| r.teachers.is_empty()).count(),
        records_without_places: records.iter().filter(|r| r.places.is_empty()).count(),
    };

    if !overlong.is_empty() {
        warn!(
            count = overlong.len(),
            reconciled = ?overlong
                .iter()
                .map(|g| format!("{} -> {}", g, canonical_group_number(g)))
                .collect::<Vec<_>>(),
            "Group numbers reconciled to canonical codes"
        );
    }

    if quality.records_without_groups > 0 {
        warn!(
            count = quality.records_without_groups,
            subjects = ?records
                .iter()
                .filter(|r| r.groups.is_empty())
                .map(|r| r.subject.as_str())
                .collect::<BTreeSet<_>>(),
            "Lessons without groups will be stored unlinked"
        );
    }

    info!(
        records = records.len(),
        overlong_group_numbers = quality.overlong_group_numbers,
        without_groups = quality.records_without_groups,
        without_teachers = quality.records_without_teachers,
        without_places = quality.records_without_places,
        "Data quality inspected"
    );

    quality
}
