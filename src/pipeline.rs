use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::analysis;
use crate::db::ScheduleStore;
use crate::fetcher::PageSource;
use crate::models::{DataQuality, ImportRun, ImportStatus, LessonRecord, SourcePage};
use crate::normalizer::normalize_cell;
use crate::page_parser::Page;
use crate::resolver::{ExactMatch, Generation, NameKey};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no pages fetched ({failed} of {requested} requests failed)")]
    NoPages { requested: usize, failed: usize },

    #[error("no lessons found in {pages} fetched pages")]
    NoLessons { pages: usize },

    #[error("import cancelled before the schedule was written")]
    Cancelled,

    #[error("an import is already running")]
    AlreadyRunning,

    #[error("parse task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ImportError {
    fn status(&self) -> ImportStatus {
        match self {
            ImportError::NoPages { .. } => ImportStatus::NoPages,
            ImportError::NoLessons { .. } => ImportStatus::NoLessons,
            ImportError::Cancelled => ImportStatus::Cancelled,
            ImportError::AlreadyRunning | ImportError::Task(_) | ImportError::Store(_) => {
                ImportStatus::Failed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

/// Parsed and resolved batch, produced off the async runtime.
struct Batch {
    cells: usize,
    records: usize,
    quality: DataQuality,
    generation: Generation,
}

/// Runs the fetch, parse, normalise, resolve and write pipeline, one run at a time.
pub struct Importer {
    source: Arc<dyn PageSource>,
    store: Arc<dyn ScheduleStore>,
    name_key: Arc<dyn NameKey>,
    lease: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl Importer {
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Arc<dyn ScheduleStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            name_key: Arc::new(ExactMatch),
            lease: Arc::new(Mutex::new(())),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lease.try_lock().is_err()
    }

    /// Wait until no run holds the lease.
    pub async fn wait_idle(&self) {
        let _lease = self.lease.lock().await;
    }

    /// Start a background run unless one is already active.
    pub fn trigger(self: &Arc<Self>, force: bool) -> TriggerOutcome {
        let Ok(lease) = Arc::clone(&self.lease).try_lock_owned() else {
            info!(force = force, "Import already running, trigger ignored");
            return TriggerOutcome::AlreadyRunning;
        };

        let importer = Arc::clone(self);
        tokio::spawn(async move {
            let _lease = lease;
            if let Err(e) = importer.run_locked(force).await {
                error!(error = %e, "Background import failed");
            }
        });

        TriggerOutcome::Started
    }

    /// Run one import to completion in the calling task.
    pub async fn run_once(&self, force: bool) -> Result<ImportRun, ImportError> {
        let Ok(_lease) = Arc::clone(&self.lease).try_lock_owned() else {
            return Err(ImportError::AlreadyRunning);
        };
        self.run_locked(force).await
    }

    #[instrument(skip(self), fields(source = self.source.name()))]
    async fn run_locked(&self, force: bool) -> Result<ImportRun, ImportError> {
        let start = Instant::now();
        let mut run = ImportRun::started(Utc::now(), force);

        info!("Starting schedule import");
        let result = self.execute(&mut run).await;

        run.finished_at = Utc::now();
        run.duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => run.status = ImportStatus::Succeeded,
            Err(e) => {
                run.status = e.status();
                run.error = Some(format!("{:#}", e));
            }
        }

        match self.store.log_import(&run).await {
            Ok(run_id) => debug!(run_id = run_id, "Import run recorded"),
            Err(e) => warn!(error = %e, "Failed to record import run"),
        }

        match result {
            Ok(()) => {
                info!(
                    pages_fetched = run.pages_fetched,
                    pages_failed = run.pages_failed,
                    lessons = run.lessons,
                    groups = run.groups,
                    skipped_references = run.skipped_references,
                    total_duration_ms = run.duration_ms,
                    "Schedule import completed"
                );
                Ok(run)
            }
            Err(e) => {
                warn!(
                    status = run.status.as_str(),
                    error = %e,
                    total_duration_ms = run.duration_ms,
                    "Schedule import aborted, stored schedule left unchanged"
                );
                Err(e)
            }
        }
    }

    async fn execute(&self, run: &mut ImportRun) -> Result<(), ImportError> {
        let fetch_start = Instant::now();
        let outcome = self.source.fetch_pages(&self.shutdown).await;
        run.pages_requested = outcome.requested;
        run.pages_fetched = outcome.pages.len();
        run.pages_failed = outcome.failed;

        info!(
            pages_fetched = run.pages_fetched,
            pages_failed = run.pages_failed,
            fetch_duration_ms = fetch_start.elapsed().as_millis(),
            "Fetch phase completed"
        );

        if outcome.cancelled {
            return Err(ImportError::Cancelled);
        }
        if outcome.pages.is_empty() {
            return Err(ImportError::NoPages {
                requested: outcome.requested,
                failed: outcome.failed,
            });
        }

        let parse_start = Instant::now();
        let pages = outcome.pages;
        let page_count = pages.len();
        let name_key = Arc::clone(&self.name_key);
        let batch = tokio::task::spawn_blocking(move || build_batch(&pages, name_key.as_ref())).await?;

        run.cells_parsed = batch.cells;
        run.records = batch.records;
        run.quality = batch.quality;
        run.lessons = batch.generation.lessons.len();
        run.teachers = batch.generation.teachers.len();
        run.groups = batch.generation.groups.len();
        run.subjects = batch.generation.subjects.len();
        run.places = batch.generation.places.len();
        run.skipped_references = batch.generation.skipped_references;

        info!(
            cells = run.cells_parsed,
            records = run.records,
            lessons = run.lessons,
            parse_duration_ms = parse_start.elapsed().as_millis(),
            "Parse phase completed"
        );

        if batch.generation.is_empty() {
            return Err(ImportError::NoLessons { pages: page_count });
        }
        if self.shutdown.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        self.store.replace_generation(&batch.generation).await?;
        Ok(())
    }
}

fn build_batch(pages: &[SourcePage], name_key: &dyn NameKey) -> Batch {
    let mut cells = 0;
    let mut records: Vec<LessonRecord> = Vec::new();

    for source in pages {
        let page = Page::parse(&source.url, &source.html);
        let before = records.len();
        for cell in page.cells() {
            cells += 1;
            records.extend(normalize_cell(&cell));
        }
        debug!(
            url = %source.url,
            group = page.group().unwrap_or("-"),
            records = records.len() - before,
            "Page parsed"
        );
    }

    let quality = analysis::inspect(&records);
    let generation = Generation::build(&records, name_key);

    Batch {
        cells,
        records: records.len(),
        quality,
        generation,
    }
}
