use anyhow::Result;
use chrono::{Datelike, Days, Local, NaiveDate};
use serde::Serialize;

use crate::db::Database;
use crate::models::{LessonView, WeekType};

/// Upper weeks are the even ISO weeks.
pub fn week_type_for(date: NaiveDate) -> WeekType {
    if date.iso_week().week() % 2 == 0 {
        WeekType::Upper
    } else {
        WeekType::Lower
    }
}

/// Monday-based weekday, 0..=6.
pub fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn tomorrow() -> NaiveDate {
    today()
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX)
}

/// A lesson on a concrete calendar date.
#[derive(Debug, Clone, Serialize)]
pub struct DatedLesson {
    pub date: String,
    #[serde(flatten)]
    pub lesson: LessonView,
}

/// Lessons of a group on `date`, filtered by that date's weekday and week type.
pub async fn lessons_on(db: &Database, group_id: i64, date: NaiveDate) -> Result<Vec<DatedLesson>> {
    let lessons = db
        .group_lessons(group_id, Some(weekday_of(date)), Some(week_type_for(date)))
        .await?;

    let formatted = date.format("%d.%m.%Y").to_string();
    Ok(lessons
        .into_iter()
        .map(|lesson| DatedLesson {
            date: formatted.clone(),
            lesson,
        })
        .collect())
}
