use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use libsql::params::Params;
use libsql::{params, Builder, Connection, Row, TransactionBehavior, Value};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::models::{weekday_name, Group, ImportRun, LessonView, Parity, WeekType};
use crate::resolver::Generation;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS teachers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS student_groups (
        id INTEGER PRIMARY KEY,
        number TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS subjects (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS places (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS lessons (
        id INTEGER PRIMARY KEY,
        subject_id INTEGER NOT NULL REFERENCES subjects(id),
        weekday INTEGER NOT NULL CHECK (weekday BETWEEN 0 AND 6),
        number INTEGER NOT NULL CHECK (number > 0),
        start_time TEXT,
        end_time TEXT,
        odd_week INTEGER NOT NULL,
        even_week INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS lesson_teachers (
        lesson_id INTEGER NOT NULL REFERENCES lessons(id),
        teacher_id INTEGER NOT NULL REFERENCES teachers(id),
        PRIMARY KEY (lesson_id, teacher_id)
    );

    CREATE TABLE IF NOT EXISTS lesson_groups (
        lesson_id INTEGER NOT NULL REFERENCES lessons(id),
        group_id INTEGER NOT NULL REFERENCES student_groups(id),
        PRIMARY KEY (lesson_id, group_id)
    );

    CREATE TABLE IF NOT EXISTS lesson_places (
        lesson_id INTEGER NOT NULL REFERENCES lessons(id),
        place_id INTEGER NOT NULL REFERENCES places(id),
        PRIMARY KEY (lesson_id, place_id)
    );

    CREATE INDEX IF NOT EXISTS idx_lesson_groups_group
        ON lesson_groups(group_id);
    CREATE INDEX IF NOT EXISTS idx_lessons_slot
        ON lessons(weekday, number);

    CREATE TABLE IF NOT EXISTS import_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        status TEXT NOT NULL,
        forced INTEGER NOT NULL,
        pages_requested INTEGER NOT NULL,
        pages_fetched INTEGER NOT NULL,
        pages_failed INTEGER NOT NULL,
        cells_parsed INTEGER NOT NULL,
        records INTEGER NOT NULL,
        lessons INTEGER NOT NULL,
        teachers INTEGER NOT NULL,
        groups_count INTEGER NOT NULL,
        subjects INTEGER NOT NULL,
        places INTEGER NOT NULL,
        skipped_references INTEGER NOT NULL,
        overlong_group_numbers INTEGER NOT NULL,
        records_without_groups INTEGER NOT NULL,
        records_without_teachers INTEGER NOT NULL,
        records_without_places INTEGER NOT NULL,
        error TEXT,
        duration_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_import_runs_started_at
        ON import_runs(started_at);

    CREATE TABLE IF NOT EXISTS user_groups (
        user_id INTEGER PRIMARY KEY,
        group_number TEXT NOT NULL,
        selected_at TEXT NOT NULL
    );
"#;

/// Associations first, then the entities they reference.
const CLEAR_SCHEDULE: &str = r#"
    DELETE FROM lesson_teachers;
    DELETE FROM lesson_groups;
    DELETE FROM lesson_places;
    DELETE FROM lessons;
    DELETE FROM teachers;
    DELETE FROM student_groups;
    DELETE FROM subjects;
    DELETE FROM places;
"#;

const IMPORT_RUN_COLUMNS: &str = "id, started_at, finished_at, status, forced, \
    pages_requested, pages_fetched, pages_failed, cells_parsed, records, lessons, \
    teachers, groups_count, subjects, places, skipped_references, \
    overlong_group_numbers, records_without_groups, records_without_teachers, \
    records_without_places, error, duration_ms";

/// Destination of import runs. The pipeline only ever talks to this trait.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Replace every schedule table with `generation` in one transaction.
    /// On error the previously stored generation stays intact.
    async fn replace_generation(&self, generation: &Generation) -> Result<()>;

    /// Append a run to the import log, returning its id.
    async fn log_import(&self, run: &ImportRun) -> Result<i64>;
}

pub struct Database {
    _db: libsql::Database,
    conn: Connection,
    db_type: &'static str,
    /// Held shared by readers and exclusively by writers, so no query ever
    /// observes a half-replaced generation on the shared connection.
    lock: RwLock<()>,
}

impl Database {
    /// Open a local SQLite database
    pub async fn open(path: &Path) -> Result<Self> {
        let db = Builder::new_local(path)
            .build()
            .await
            .context("Failed to open database")?;
        Self::init(db, "sqlite").await
    }

    /// Open a remote Turso database
    pub async fn open_turso(url: &str, auth_token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .context("Failed to connect to Turso database")?;
        Self::init(db, "turso").await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .context("Failed to open in-memory database")?;
        Self::init(db, "memory").await
    }

    async fn init(db: libsql::Database, db_type: &'static str) -> Result<Self> {
        let conn = db.connect().context("Failed to connect to database")?;
        conn.execute_batch(SCHEMA)
            .await
            .context("Failed to initialize schema")?;

        debug!(db_type = db_type, "Database schema initialized");

        Ok(Self {
            _db: db,
            conn,
            db_type,
            lock: RwLock::new(()),
        })
    }

    pub fn db_type(&self) -> &'static str {
        self.db_type
    }

    pub async fn get_group(&self, id: i64) -> Result<Option<Group>> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT id, number, name FROM student_groups WHERE id = ?1",
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(group_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn find_group_by_number(&self, number: &str) -> Result<Option<Group>> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT id, number, name FROM student_groups WHERE number = ?1",
                params![number],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(group_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Case-insensitive substring search over group numbers and display names.
    /// SQLite's `LIKE` folds ASCII only, so Cyrillic suffixes are matched here.
    pub async fn search_groups(&self, query: &str, limit: usize) -> Result<Vec<Group>> {
        let needle = query.trim().to_lowercase();
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT id, number, name FROM student_groups ORDER BY number",
                (),
            )
            .await?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            let group = group_from_row(&row)?;
            if group.number.to_lowercase().contains(&needle)
                || group.name.to_lowercase().contains(&needle)
            {
                groups.push(group);
                if groups.len() >= limit {
                    break;
                }
            }
        }

        debug!(query = %query, matches = groups.len(), "Group search");
        Ok(groups)
    }

    /// Lessons linked to a group, ordered by weekday then period number.
    #[instrument(skip(self))]
    pub async fn group_lessons(
        &self,
        group_id: i64,
        weekday: Option<u8>,
        week: Option<WeekType>,
    ) -> Result<Vec<LessonView>> {
        let mut sql = String::from(
            "SELECT l.id, s.name, l.weekday, l.number, l.start_time, l.end_time, \
                    l.odd_week, l.even_week \
             FROM lessons l \
             JOIN lesson_groups lg ON lg.lesson_id = l.id \
             LEFT JOIN subjects s ON s.id = l.subject_id \
             WHERE lg.group_id = ?1",
        );
        let mut args = vec![Value::Integer(group_id)];

        if let Some(weekday) = weekday {
            args.push(Value::Integer(weekday as i64));
            sql.push_str(&format!(" AND l.weekday = ?{}", args.len()));
        }
        match week {
            Some(WeekType::Upper) => sql.push_str(" AND l.even_week = 1"),
            Some(WeekType::Lower) => sql.push_str(" AND l.odd_week = 1"),
            None => {}
        }
        sql.push_str(" ORDER BY l.weekday, l.number, l.id");

        let _guard = self.lock.read().await;

        let mut rows = self.conn.query(&sql, Params::Positional(args)).await?;
        let mut lessons = Vec::new();
        while let Some(row) = rows.next().await? {
            let weekday = row.get::<i64>(2)? as u8;
            let odd_week = row.get::<i64>(6)? != 0;
            let even_week = row.get::<i64>(7)? != 0;
            lessons.push(LessonView {
                id: row.get(0)?,
                subject: row
                    .get::<Option<String>>(1)?
                    .unwrap_or_else(|| "Нет данных".to_string()),
                teachers: Vec::new(),
                places: Vec::new(),
                weekday,
                weekday_name: weekday_name(weekday),
                number: row.get::<i64>(3)? as u32,
                start_time: row.get(4)?,
                end_time: row.get(5)?,
                odd_week,
                even_week,
                week_type: Parity::from_flags(odd_week, even_week),
            });
        }

        if lessons.is_empty() {
            return Ok(lessons);
        }

        let mut teachers = self
            .linked_names(
                "SELECT lt.lesson_id, t.name FROM lesson_teachers lt \
                 JOIN teachers t ON t.id = lt.teacher_id \
                 JOIN lesson_groups lg ON lg.lesson_id = lt.lesson_id \
                 WHERE lg.group_id = ?1 ORDER BY lt.rowid",
                group_id,
            )
            .await?;
        let mut places = self
            .linked_names(
                "SELECT lp.lesson_id, p.name FROM lesson_places lp \
                 JOIN places p ON p.id = lp.place_id \
                 JOIN lesson_groups lg ON lg.lesson_id = lp.lesson_id \
                 WHERE lg.group_id = ?1 ORDER BY lp.rowid",
                group_id,
            )
            .await?;

        for lesson in &mut lessons {
            lesson.teachers = teachers.remove(&lesson.id).unwrap_or_default();
            lesson.places = places.remove(&lesson.id).unwrap_or_default();
        }

        debug!(lessons = lessons.len(), "Group lessons loaded");
        Ok(lessons)
    }

    async fn linked_names(&self, sql: &str, group_id: i64) -> Result<HashMap<i64, Vec<String>>> {
        let mut rows = self.conn.query(sql, params![group_id]).await?;
        let mut names: HashMap<i64, Vec<String>> = HashMap::new();
        while let Some(row) = rows.next().await? {
            names
                .entry(row.get::<i64>(0)?)
                .or_default()
                .push(row.get::<String>(1)?);
        }
        Ok(names)
    }

    /// Store a user's group by its canonical number so the choice survives
    /// reloads that reassign group ids.
    pub async fn select_user_group(&self, user_id: i64, group_number: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        self.conn
            .execute(
                "INSERT INTO user_groups (user_id, group_number, selected_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    group_number = excluded.group_number,
                    selected_at = excluded.selected_at",
                params![user_id, group_number, Utc::now().to_rfc3339()],
            )
            .await
            .context("Failed to store user group")?;

        info!(user_id = user_id, group_number = %group_number, "User group selected");
        Ok(())
    }

    pub async fn user_group_number(&self, user_id: i64) -> Result<Option<String>> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT group_number FROM user_groups WHERE user_id = ?1",
                params![user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub async fn table_counts(&self) -> Result<TableCounts> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM teachers),
                    (SELECT COUNT(*) FROM student_groups),
                    (SELECT COUNT(*) FROM subjects),
                    (SELECT COUNT(*) FROM places),
                    (SELECT COUNT(*) FROM lessons),
                    (SELECT COUNT(*) FROM lesson_teachers),
                    (SELECT COUNT(*) FROM lesson_groups),
                    (SELECT COUNT(*) FROM lesson_places)",
                (),
            )
            .await?;

        let row = rows.next().await?.context("Count query returned no rows")?;
        Ok(TableCounts {
            teachers: row.get(0)?,
            groups: row.get(1)?,
            subjects: row.get(2)?,
            places: row.get(3)?,
            lessons: row.get(4)?,
            lesson_teachers: row.get(5)?,
            lesson_groups: row.get(6)?,
            lesson_places: row.get(7)?,
        })
    }

    /// Get recent import runs, newest first
    pub async fn get_import_runs(&self, limit: usize) -> Result<Vec<ImportRunEntry>> {
        let _guard = self.lock.read().await;
        let sql = format!(
            "SELECT {} FROM import_runs ORDER BY id DESC LIMIT ?1",
            IMPORT_RUN_COLUMNS
        );
        let mut rows = self.conn.query(&sql, params![limit as i64]).await?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await? {
            runs.push(import_run_from_row(&row)?);
        }
        Ok(runs)
    }

    pub async fn get_import_run(&self, id: i64) -> Result<Option<ImportRunEntry>> {
        let _guard = self.lock.read().await;
        let sql = format!("SELECT {} FROM import_runs WHERE id = ?1", IMPORT_RUN_COLUMNS);
        let mut rows = self.conn.query(&sql, params![id]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(import_run_from_row(&row)?)),
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub async fn names(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("SELECT name FROM {} ORDER BY id", table);
        let mut rows = self.conn.query(&sql, ()).await?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await? {
            names.push(row.get(0)?);
        }
        Ok(names)
    }
}

#[async_trait]
impl ScheduleStore for Database {
    #[instrument(skip_all, fields(db_type = self.db_type, lessons = generation.lessons.len()))]
    async fn replace_generation(&self, generation: &Generation) -> Result<()> {
        let start = Instant::now();
        let _guard = self.lock.write().await;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .context("Failed to begin import transaction")?;

        if let Err(e) = write_generation(&tx, generation).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            return Err(e);
        }

        tx.commit()
            .await
            .context("Failed to commit import transaction")?;

        info!(
            teachers = generation.teachers.len(),
            groups = generation.groups.len(),
            subjects = generation.subjects.len(),
            places = generation.places.len(),
            lessons = generation.lessons.len(),
            lesson_teachers = generation.lesson_teachers.len(),
            lesson_groups = generation.lesson_groups.len(),
            lesson_places = generation.lesson_places.len(),
            write_duration_ms = start.elapsed().as_millis(),
            "Schedule generation replaced"
        );
        Ok(())
    }

    async fn log_import(&self, run: &ImportRun) -> Result<i64> {
        let _guard = self.lock.write().await;
        let mut rows = self
            .conn
            .query(
                "INSERT INTO import_runs (
                    started_at, finished_at, status, forced,
                    pages_requested, pages_fetched, pages_failed, cells_parsed,
                    records, lessons, teachers, groups_count, subjects, places,
                    skipped_references, overlong_group_numbers, records_without_groups,
                    records_without_teachers, records_without_places, error, duration_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                          ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                RETURNING id",
                params![
                    run.started_at.to_rfc3339(),
                    run.finished_at.to_rfc3339(),
                    run.status.as_str(),
                    run.forced as i64,
                    run.pages_requested as i64,
                    run.pages_fetched as i64,
                    run.pages_failed as i64,
                    run.cells_parsed as i64,
                    run.records as i64,
                    run.lessons as i64,
                    run.teachers as i64,
                    run.groups as i64,
                    run.subjects as i64,
                    run.places as i64,
                    run.skipped_references as i64,
                    run.quality.overlong_group_numbers as i64,
                    run.quality.records_without_groups as i64,
                    run.quality.records_without_teachers as i64,
                    run.quality.records_without_places as i64,
                    run.error.clone(),
                    run.duration_ms as i64,
                ],
            )
            .await
            .context("Failed to log import run")?;

        let id = rows
            .next()
            .await?
            .context("Import run insert returned no id")?
            .get::<i64>(0)?;

        debug!(run_id = id, status = run.status.as_str(), "Import run logged");
        Ok(id)
    }
}

async fn write_generation(conn: &Connection, generation: &Generation) -> Result<()> {
    conn.execute_batch(CLEAR_SCHEDULE)
        .await
        .context("Failed to clear previous schedule")?;

    for teacher in &generation.teachers {
        conn.execute(
            "INSERT INTO teachers (id, name) VALUES (?1, ?2)",
            params![teacher.id, teacher.name.as_str()],
        )
        .await
        .with_context(|| format!("Failed to insert teacher '{}'", teacher.name))?;
    }

    for group in &generation.groups {
        conn.execute(
            "INSERT INTO student_groups (id, number, name) VALUES (?1, ?2, ?3)",
            params![group.id, group.number.as_str(), group.name.as_str()],
        )
        .await
        .with_context(|| format!("Failed to insert group '{}'", group.number))?;
    }

    for subject in &generation.subjects {
        conn.execute(
            "INSERT INTO subjects (id, name) VALUES (?1, ?2)",
            params![subject.id, subject.name.as_str()],
        )
        .await
        .with_context(|| format!("Failed to insert subject '{}'", subject.name))?;
    }

    for place in &generation.places {
        conn.execute(
            "INSERT INTO places (id, name) VALUES (?1, ?2)",
            params![place.id, place.name.as_str()],
        )
        .await
        .with_context(|| format!("Failed to insert place '{}'", place.name))?;
    }

    for lesson in &generation.lessons {
        conn.execute(
            "INSERT INTO lessons (id, subject_id, weekday, number, start_time, end_time, odd_week, even_week)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                lesson.id,
                lesson.subject_id,
                lesson.weekday as i64,
                lesson.number as i64,
                lesson.start_time.clone(),
                lesson.end_time.clone(),
                lesson.odd_week as i64,
                lesson.even_week as i64,
            ],
        )
        .await
        .with_context(|| format!("Failed to insert lesson {}", lesson.id))?;
    }

    insert_edges(
        conn,
        "INSERT OR IGNORE INTO lesson_teachers (lesson_id, teacher_id) VALUES (?1, ?2)",
        &generation.lesson_teachers,
    )
    .await?;
    insert_edges(
        conn,
        "INSERT OR IGNORE INTO lesson_groups (lesson_id, group_id) VALUES (?1, ?2)",
        &generation.lesson_groups,
    )
    .await?;
    insert_edges(
        conn,
        "INSERT OR IGNORE INTO lesson_places (lesson_id, place_id) VALUES (?1, ?2)",
        &generation.lesson_places,
    )
    .await?;

    Ok(())
}

async fn insert_edges(conn: &Connection, sql: &str, edges: &[(i64, i64)]) -> Result<()> {
    for &(lesson_id, other_id) in edges {
        conn.execute(sql, params![lesson_id, other_id])
            .await
            .with_context(|| format!("Failed to link lesson {} to {}", lesson_id, other_id))?;
    }
    Ok(())
}

fn group_from_row(row: &Row) -> Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        number: row.get(1)?,
        name: row.get(2)?,
    })
}

fn import_run_from_row(row: &Row) -> Result<ImportRunEntry> {
    Ok(ImportRunEntry {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status: row.get(3)?,
        forced: row.get::<i64>(4)? != 0,
        pages_requested: row.get(5)?,
        pages_fetched: row.get(6)?,
        pages_failed: row.get(7)?,
        cells_parsed: row.get(8)?,
        records: row.get(9)?,
        lessons: row.get(10)?,
        teachers: row.get(11)?,
        groups: row.get(12)?,
        subjects: row.get(13)?,
        places: row.get(14)?,
        skipped_references: row.get(15)?,
        overlong_group_numbers: row.get(16)?,
        records_without_groups: row.get(17)?,
        records_without_teachers: row.get(18)?,
        records_without_places: row.get(19)?,
        error: row.get(20)?,
        duration_ms: row.get(21)?,
    })
}

/// Row counts of the schedule tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub teachers: i64,
    pub groups: i64,
    pub subjects: i64,
    pub places: i64,
    pub lessons: i64,
    pub lesson_teachers: i64,
    pub lesson_groups: i64,
    pub lesson_places: i64,
}

/// Import run as read back from the log
#[derive(Debug, Clone, Serialize)]
pub struct ImportRunEntry {
    pub id: i64,
    pub started_at: String,
    pub finished_at: String,
    pub status: String,
    pub forced: bool,
    pub pages_requested: i64,
    pub pages_fetched: i64,
    pub pages_failed: i64,
    pub cells_parsed: i64,
    pub records: i64,
    pub lessons: i64,
    pub teachers: i64,
    pub groups: i64,
    pub subjects: i64,
    pub places: i64,
    pub skipped_references: i64,
    pub overlong_group_numbers: i64,
    pub records_without_groups: i64,
    pub records_without_teachers: i64,
    pub records_without_places: i64,
    pub error: Option<String>,
    pub duration_ms: i64,
}
