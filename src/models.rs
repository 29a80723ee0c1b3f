use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fetched schedule page.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub url: String,
    pub html: String,
}

impl SourcePage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }
}

/// Which weeks of the two-week cycle a lesson runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Odd,
    Even,
    Both,
}

impl Parity {
    /// `(odd_week, even_week)` flags as stored on a lesson row.
    pub fn flags(self) -> (bool, bool) {
        match self {
            Parity::Odd => (true, false),
            Parity::Even => (false, true),
            Parity::Both => (true, true),
        }
    }

    /// Inverse of [`Parity::flags`]. Rows with neither flag set map to `Both`.
    pub fn from_flags(odd_week: bool, even_week: bool) -> Self {
        match (odd_week, even_week) {
            (true, false) => Parity::Odd,
            (false, true) => Parity::Even,
            _ => Parity::Both,
        }
    }

    /// Week-type word for this parity: even-week lessons run in upper weeks.
    pub fn week_label(self) -> &'static str {
        match self {
            Parity::Odd => "lower",
            Parity::Even => "upper",
            Parity::Both => "both",
        }
    }

    /// Merge two markers found in the same lesson text.
    pub fn combine(self, other: Parity) -> Parity {
        if self == other {
            self
        } else {
            Parity::Both
        }
    }
}

/// Upper weeks run lessons with the even-week flag, lower weeks the odd-week flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekType {
    Upper,
    Lower,
}

impl FromStr for WeekType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "upper" | "верхняя" => Ok(WeekType::Upper),
            "lower" | "нижняя" => Ok(WeekType::Lower),
            other => Err(format!(
                "Unknown week type '{}': expected 'upper' or 'lower'",
                other
            )),
        }
    }
}

/// Start and end of a period, formatted as `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

impl TimeRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// One schedule-table cell before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCell {
    pub source: String,
    pub row: usize,
    pub column: usize,
    /// Cell text; `<br>` boundaries are kept as `\n`.
    pub text: String,
    pub weekdays: Vec<u8>,
    pub period: u32,
    /// Number of consecutive periods covered (`rowspan`).
    pub period_span: u32,
    pub time: Option<TimeRange>,
    pub parity_hint: Option<Parity>,
    pub page_group: Option<String>,
}

/// A canonical lesson at a single (weekday, period) slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LessonRecord {
    pub subject: String,
    pub teachers: Vec<String>,
    /// Raw group numbers; reconciled during resolution.
    pub groups: Vec<String>,
    pub places: Vec<String>,
    pub weekday: u8,
    pub period: u32,
    pub time: Option<TimeRange>,
    pub parity: Parity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Teacher {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: i64,
    pub number: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Place {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lesson {
    pub id: i64,
    pub subject_id: i64,
    pub weekday: u8,
    pub number: u32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub odd_week: bool,
    pub even_week: bool,
}

/// A lesson as served by the query API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LessonView {
    pub id: i64,
    pub subject: String,
    pub teachers: Vec<String>,
    pub places: Vec<String>,
    pub weekday: u8,
    pub weekday_name: &'static str,
    pub number: u32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub odd_week: bool,
    pub even_week: bool,
    /// Served as `upper`/`lower`/`both`, the same words the `week_type` filter takes.
    #[serde(serialize_with = "serialize_week_label")]
    pub week_type: Parity,
}

fn serialize_week_label<S: serde::Serializer>(parity: &Parity, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(parity.week_label())
}

pub const WEEKDAY_NAMES: [&str; 7] = [
    "Понедельник",
    "Вторник",
    "Среда",
    "Четверг",
    "Пятница",
    "Суббота",
    "Воскресенье",
];

pub fn weekday_name(weekday: u8) -> &'static str {
    WEEKDAY_NAMES
        .get(weekday as usize)
        .copied()
        .unwrap_or("Неизвестно")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Succeeded,
    NoPages,
    NoLessons,
    Cancelled,
    Failed,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::Succeeded => "succeeded",
            ImportStatus::NoPages => "no_pages",
            ImportStatus::NoLessons => "no_lessons",
            ImportStatus::Cancelled => "cancelled",
            ImportStatus::Failed => "failed",
        }
    }
}

/// Counters describing records that will be persisted with missing data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataQuality {
    pub overlong_group_numbers: usize,
    pub records_without_groups: usize,
    pub records_without_teachers: usize,
    pub records_without_places: usize,
}

/// Outcome of one import run, as written to the run log.
#[derive(Debug, Clone)]
pub struct ImportRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ImportStatus,
    pub forced: bool,
    pub pages_requested: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub cells_parsed: usize,
    pub records: usize,
    pub lessons: usize,
    pub teachers: usize,
    pub groups: usize,
    pub subjects: usize,
    pub places: usize,
    pub skipped_references: usize,
    pub quality: DataQuality,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ImportRun {
    pub fn started(started_at: DateTime<Utc>, forced: bool) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            status: ImportStatus::Failed,
            forced,
            pages_requested: 0,
            pages_fetched: 0,
            pages_failed: 0,
            cells_parsed: 0,
            records: 0,
            lessons: 0,
            teachers: 0,
            groups: 0,
            subjects: 0,
            places: 0,
            skipped_references: 0,
            quality: DataQuality::default(),
            error: None,
            duration_ms: 0,
        }
    }
}
