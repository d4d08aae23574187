use crate::auth::JwtAuth;
use crate::export::{matches_export, write_export, ExportItem};
use crate::metrics::{JOBS_PROCESSED, JOBS_QUEUED, JOURNAL_CLINICAL_FLAGS};
use crate::models::{JournalEntry, JournalExport};
use crate::nlp_service::NlpService;
use anyhow::Context;
use chrono::{Duration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Confidence recorded on tags attached from detected topics.
const AI_TAG_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    AnalyzeJournalEntry(Uuid),
    GenerateExport(Uuid),
    CleanupExpiredExports,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::AnalyzeJournalEntry(_) => "analyze_journal_entry",
            Job::GenerateExport(_) => "generate_export",
            Job::CleanupExpiredExports => "cleanup_expired_exports",
        }
    }
}

/// Fire-and-forget handle to the background worker.
#[derive(Clone)]
pub struct JobQueue {
    tx: UnboundedSender<Job>,
}

impl JobQueue {
    pub fn new() -> (Self, UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. A stopped worker only produces a warning.
    pub fn enqueue(&self, job: Job) {
        match self.tx.send(job) {
            Ok(()) => JOBS_QUEUED.inc(),
            Err(_) => warn!(job = job.name(), "Job worker is not running; job dropped"),
        }
    }
}

/// Runs the NLP analyzer over an entry, stores the result and attaches
/// system tags for detected topics.
pub async fn apply_entry_analysis(
    pool: &PgPool,
    nlp: &NlpService,
    entry: &JournalEntry,
) -> Result<JournalEntry, sqlx::Error> {
    let analysis = nlp.analyze_entry(entry);

    let updated: JournalEntry = sqlx::query_as(
        "UPDATE journal_entries SET sentiment_score = $2, sentiment_label = $3, keywords = $4,
            entities = $5, topics = $6, urgency_score = $7, clinical_flags = $8, updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(entry.id)
    .bind(analysis.sentiment_score)
    .bind(analysis.sentiment_label)
    .bind(Json(&analysis.keywords))
    .bind(Json(&analysis.entities))
    .bind(Json(&analysis.topics))
    .bind(analysis.urgency_score)
    .bind(Json(&analysis.clinical_flags))
    .fetch_one(pool)
    .await?;

    if !analysis.topics.is_empty() {
        sqlx::query(
            "INSERT INTO journal_entry_tags (entry_id, tag_id, confidence, added_by_ai)
             SELECT $1, id, $3, TRUE FROM journal_tags WHERE is_system_tag AND name = ANY($2)
             ON CONFLICT (entry_id, tag_id) DO NOTHING",
        )
        .bind(entry.id)
        .bind(&analysis.topics)
        .bind(AI_TAG_CONFIDENCE)
        .execute(pool)
        .await?;
    }

    for flag in &analysis.clinical_flags {
        JOURNAL_CLINICAL_FLAGS.with_label_values(&[&flag.category]).inc();
    }
    if !analysis.clinical_flags.is_empty() {
        warn!(entry_id = %entry.id, flags = analysis.clinical_flags.len(), "Journal entry raised clinical flags");
    }

    Ok(updated)
}

/// Consumes jobs one at a time with its own pool handle.
pub struct JobWorker {
    pool: PgPool,
    nlp: NlpService,
    export_dir: PathBuf,
    retention_days: i64,
}

impl JobWorker {
    pub fn new(pool: PgPool, nlp: NlpService, export_dir: impl Into<PathBuf>, retention_days: i64) -> Self {
        Self {
            pool,
            nlp,
            export_dir: export_dir.into(),
            retention_days,
        }
    }

    pub fn spawn(self, mut rx: UnboundedReceiver<Job>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Background job worker started");
            while let Some(job) = rx.recv().await {
                JOBS_QUEUED.dec();
                match self.handle(job).await {
                    Ok(()) => {
                        JOBS_PROCESSED.with_label_values(&[job.name(), "ok"]).inc();
                    }
                    Err(e) => {
                        JOBS_PROCESSED.with_label_values(&[job.name(), "error"]).inc();
                        error!(job = job.name(), error = %e, "Background job failed");
                    }
                }
            }
            info!("Background job worker stopped");
        })
    }

    pub async fn handle(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::AnalyzeJournalEntry(id) => self.analyze_entry(id).await,
            Job::GenerateExport(id) => self.generate_export(id).await,
            Job::CleanupExpiredExports => self.cleanup_expired_exports().await,
        }
    }

    async fn analyze_entry(&self, id: Uuid) -> anyhow::Result<()> {
        let entry: Option<JournalEntry> = sqlx::query_as("SELECT * FROM journal_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(entry) = entry else {
            warn!(entry_id = %id, "Journal entry vanished before analysis");
            return Ok(());
        };

        apply_entry_analysis(&self.pool, &self.nlp, &entry)
            .await
            .context("storing entry analysis")?;
        Ok(())
    }

    async fn generate_export(&self, id: Uuid) -> anyhow::Result<()> {
        let export: Option<JournalExport> = sqlx::query_as("SELECT * FROM journal_exports WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(export) = export else {
            warn!(export_id = %id, "Export vanished before generation");
            return Ok(());
        };
        if export.is_complete {
            return Ok(());
        }

        let username: String = sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
            .bind(export.user_id)
            .fetch_one(&self.pool)
            .await?;

        let items = self.load_export_items(&export).await?;

        match write_export(&self.export_dir, &export, &username, &items).await {
            Ok((path, size)) => {
                sqlx::query(
                    "UPDATE journal_exports SET file_path = $2, file_size_bytes = $3, is_complete = TRUE,
                        error_message = '', expires_at = $4 WHERE id = $1",
                )
                .bind(export.id)
                .bind(path.to_string_lossy().into_owned())
                .bind(size as i64)
                .bind(Utc::now() + Duration::days(self.retention_days))
                .execute(&self.pool)
                .await?;

                crate::audit_log!("export", "Journal export generated", export.user_id, "journal_export", export.id);
                Ok(())
            }
            Err(e) => {
                sqlx::query("UPDATE journal_exports SET error_message = $2 WHERE id = $1")
                    .bind(export.id)
                    .bind(e.to_string())
                    .execute(&self.pool)
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn load_export_items(&self, export: &JournalExport) -> Result<Vec<ExportItem>, sqlx::Error> {
        let entries: Vec<JournalEntry> = sqlx::query_as(
            "SELECT * FROM journal_entries
             WHERE user_id = $1 AND created_at::date BETWEEN $2 AND $3
             ORDER BY created_at",
        )
        .bind(export.user_id)
        .bind(export.date_range_start)
        .bind(export.date_range_end)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
        let tag_rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT et.entry_id, t.name FROM journal_entry_tags et
             JOIN journal_tags t ON t.id = et.tag_id
             WHERE et.entry_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut tags: HashMap<Uuid, Vec<String>> = HashMap::new();
        for (entry_id, name) in tag_rows {
            tags.entry(entry_id).or_default().push(name);
        }

        Ok(entries
            .into_iter()
            .map(|entry| ExportItem {
                tag_names: tags.remove(&entry.id).unwrap_or_default(),
                entry,
            })
            .filter(|item| matches_export(export, item))
            .collect())
    }

    async fn cleanup_expired_exports(&self) -> anyhow::Result<()> {
        let expired: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT id, file_path FROM journal_exports WHERE is_complete AND expires_at < now()",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut deleted = 0u64;
        for (id, file_path) in expired {
            if !file_path.is_empty() {
                if let Err(e) = tokio::fs::remove_file(&file_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(export_id = %id, error = %e, "Could not remove export file");
                        continue;
                    }
                }
            }
            deleted += sqlx::query("DELETE FROM journal_exports WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }

        let purged = JwtAuth::purge_expired_revocations(&self.pool).await?;
        info!(exports = deleted, revocations = purged, "Expired data cleaned up");
        Ok(())
    }
}

/// Enqueues export cleanup on a fixed period.
pub fn spawn_cleanup_ticker(queue: JobQueue, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            queue.enqueue(Job::CleanupExpiredExports);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_delivers_in_order() {
        let (queue, mut rx) = JobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(Job::AnalyzeJournalEntry(id));
        queue.enqueue(Job::CleanupExpiredExports);

        assert_eq!(rx.recv().await, Some(Job::AnalyzeJournalEntry(id)));
        assert_eq!(rx.recv().await, Some(Job::CleanupExpiredExports));
    }

    #[tokio::test]
    async fn test_enqueue_after_worker_stops_does_not_panic() {
        let (queue, rx) = JobQueue::new();
        drop(rx);
        queue.enqueue(Job::GenerateExport(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_cleanup_ticker_enqueues_periodically() {
        let (queue, mut rx) = JobQueue::new();
        let handle = spawn_cleanup_ticker(queue, std::time::Duration::from_millis(20));

        let job = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(job, Some(Job::CleanupExpiredExports));
        handle.abort();
    }

    #[test]
    fn test_job_names() {
        assert_eq!(Job::GenerateExport(Uuid::nil()).name(), "generate_export");
        assert_eq!(Job::CleanupExpiredExports.name(), "cleanup_expired_exports");
    }
}
