//! Ingestion batch orchestration and scheduling.

mod config;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use covglobe_adapters::NormalizeError;
use covglobe_core::{RemoteEntry, ReportDate, ReportRecord};
use covglobe_storage::{
    FetchError, GitHubClient, RecordStore, ReportSource, StoreError, UpsertOutcome,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use config::{parse_years, SyncConfig};

pub const CRATE_NAME: &str = "covglobe-sync";

/// Which listed files count as report candidates.
#[derive(Debug, Clone, Default)]
pub struct ReportFileFilter {
    years: BTreeSet<i32>,
}

impl ReportFileFilter {
    /// An empty year set accepts every year.
    pub fn new(years: impl IntoIterator<Item = i32>) -> Self {
        Self {
            years: years.into_iter().collect(),
        }
    }

    pub fn accept(&self, name: &str) -> Option<ReportDate> {
        let stem = name.strip_suffix(".csv")?;
        let date = stem.parse::<ReportDate>().ok()?;
        (self.years.is_empty() || self.years.contains(&date.year())).then_some(date)
    }
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("normalize failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub enum FileOutcome {
    Inserted,
    Updated,
    Unchanged,
    Skipped(String),
    Failed(FileError),
}

#[derive(Debug)]
pub struct FileReport {
    pub date: String,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncRunSummary {
    fn tally(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        files: &[FileReport],
    ) -> Self {
        let mut summary = Self {
            run_id,
            started_at,
            finished_at,
            candidates: files.len(),
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
        };
        for file in files {
            match file.outcome {
                FileOutcome::Inserted => summary.inserted += 1,
                FileOutcome::Updated => summary.updated += 1,
                FileOutcome::Unchanged => summary.unchanged += 1,
                FileOutcome::Skipped(_) => summary.skipped += 1,
                FileOutcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }
}

#[derive(Debug)]
pub enum BatchOutcome {
    Completed {
        summary: SyncRunSummary,
        files: Vec<FileReport>,
    },
    /// Listing failed; nothing was fetched or written.
    Aborted { run_id: Uuid, reason: String },
    /// Another batch in this process had not finished yet.
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub reports_path: String,
    pub filter: ReportFileFilter,
    pub concurrency: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            reports_path: config.reports_path.clone(),
            filter: ReportFileFilter::new(config.report_years.iter().copied()),
            concurrency: config.concurrency,
        }
    }
}

pub struct IngestionPipeline {
    source: Arc<dyn ReportSource>,
    store: Arc<dyn RecordStore>,
    options: PipelineOptions,
    in_flight: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn ReportSource>,
        store: Arc<dyn RecordStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
            in_flight: Mutex::new(()),
        }
    }

    /// Pipeline reading from GitHub per `config`.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn RecordStore>) -> Result<Self> {
        let client = GitHubClient::new(config.github_client_config())
            .context("building GitHub client")?;
        Ok(Self::new(
            Arc::new(client),
            store,
            PipelineOptions::from_config(config),
        ))
    }

    /// Run one full batch. Per-file failures are reported, never raised.
    pub async fn run_once(&self) -> BatchOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("ingestion batch already running; skipping this trigger");
            return BatchOutcome::AlreadyRunning;
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, path = %self.options.reports_path, "initializing data scrape");

        let entries = match self.source.list_report_files(&self.options.reports_path).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(%run_id, error = %err, "listing report files failed; aborting batch");
                return BatchOutcome::Aborted {
                    run_id,
                    reason: err.to_string(),
                };
            }
        };

        let listed = entries.len();
        let candidates = entries
            .into_iter()
            .filter_map(|entry| self.options.filter.accept(&entry.name).map(|date| (date, entry)))
            .collect::<Vec<_>>();
        info!(%run_id, listed, candidates = candidates.len(), "selected report files");

        let files = stream::iter(candidates)
            .map(|(date, entry)| self.ingest_file(run_id, date, entry))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let summary = SyncRunSummary::tally(run_id, started_at, Utc::now(), &files);
        info!(
            %run_id,
            candidates = summary.candidates,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            skipped = summary.skipped,
            failed = summary.failed,
            "data scrape done"
        );

        BatchOutcome::Completed { summary, files }
    }

    async fn ingest_file(&self, run_id: Uuid, date: ReportDate, entry: RemoteEntry) -> FileReport {
        let date = date.key();
        let outcome = match self.try_ingest_file(&date, &entry).await {
            Ok(outcome) => outcome,
            Err(err) => FileOutcome::Failed(err),
        };

        match &outcome {
            FileOutcome::Inserted => info!(%run_id, date = %date, "new report stored"),
            FileOutcome::Updated => info!(%run_id, date = %date, "report updated"),
            FileOutcome::Unchanged => debug!(%run_id, date = %date, "report unchanged"),
            FileOutcome::Skipped(reason) => warn!(%run_id, date = %date, reason = %reason, "report skipped"),
            FileOutcome::Failed(err) => {
                error!(%run_id, date = %date, content_id = %entry.content_id, error = %err, "report ingestion failed")
            }
        }

        FileReport { date, outcome }
    }

    async fn try_ingest_file(
        &self,
        date: &str,
        entry: &RemoteEntry,
    ) -> Result<FileOutcome, FileError> {
        let raw = self.source.fetch_file_content(&entry.content_id).await?;
        let report = covglobe_adapters::normalize(&raw)?;
        let Some(last_update) = report.last_update else {
            return Ok(FileOutcome::Skipped("no usable rows".to_string()));
        };

        let record = ReportRecord {
            date: date.to_string(),
            last_update,
            data: report.to_canonical_csv()?,
        };

        if let Some(existing) = self.store.find_by_date(date).await? {
            if existing.last_update == record.last_update
                && existing.content_hash() == record.content_hash()
            {
                return Ok(FileOutcome::Unchanged);
            }
        }

        Ok(match self.store.upsert(&record).await? {
            UpsertOutcome::Inserted => FileOutcome::Inserted,
            UpsertOutcome::Updated => FileOutcome::Updated,
        })
    }
}

/// Cron-driven scheduler firing one batch per trigger. Not started yet.
pub async fn build_scheduler(pipeline: Arc<IngestionPipeline>, cron: String) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            info!("scheduled ingestion triggered");
            pipeline.run_once().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
