//! Control operations used by the HTTP/UI layer.

use crate::config::ImportConfig;
use crate::events::EventTrigger;
use crate::io::ImportSource;
use crate::progress::{JobId, JobRegistry, JobSnapshot, JobWriter, ProgressFeed};
use crate::store::RecordStore;
use crate::upsert::BatchUpserter;
use crate::{IngestError, IngestResult};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Starts import jobs and answers questions about them.
///
/// Every job runs on its own tokio task; jobs share the store and the event
/// queue but nothing else.
#[derive(Clone)]
pub struct Importer {
    store: Arc<dyn RecordStore>,
    config: Arc<ImportConfig>,
    jobs: JobRegistry,
    events: EventTrigger,
}

impl Importer {
    /// Fails with [`IngestError::Config`] if `config` does not validate.
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: ImportConfig,
        events: EventTrigger,
    ) -> IngestResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
            jobs: JobRegistry::new(),
            events,
        })
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn events(&self) -> &EventTrigger {
        &self.events
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Spawn a new job on the current tokio runtime and return its id at once.
    pub fn start_import(&self, source: ImportSource) -> JobId {
        let (job_id, upserter, writer, cancel) = self.prepare_job(&source, None);
        tokio::spawn(async move {
            upserter.run(source, writer, cancel).await;
        });
        job_id
    }

    /// Like [`Importer::start_import`], but runs on the caller's task until the job ends.
    pub async fn run_import(&self, source: ImportSource) -> Arc<JobSnapshot> {
        let (_, upserter, writer, cancel) = self.prepare_job(&source, None);
        upserter.run(source, writer, cancel).await
    }

    /// Re-submit an import as a brand new job.
    ///
    /// The new job records `retry_of = previous` while `previous` is still
    /// tracked; a pruned or unknown id only loses the link.
    pub fn retry_import(&self, previous: JobId, source: ImportSource) -> JobId {
        let retry_of = self.jobs.snapshot(&previous).map(|_| previous);
        let (job_id, upserter, writer, cancel) = self.prepare_job(&source, retry_of);
        match retry_of {
            Some(previous) => info!(job = %job_id, retry_of = %previous, "retrying import as new job"),
            None => info!(job = %job_id, previous = %previous, "retrying import of an untracked job as new job"),
        }
        tokio::spawn(async move {
            upserter.run(source, writer, cancel).await;
        });
        job_id
    }

    pub fn get_progress(&self, job_id: &JobId) -> Option<Arc<JobSnapshot>> {
        self.jobs.snapshot(job_id)
    }

    pub fn subscribe(&self, job_id: &JobId) -> Option<ProgressFeed> {
        self.jobs.subscribe(job_id)
    }

    /// Ask a running job to stop at its next batch boundary.
    ///
    /// Returns `false` if the job had already finished.
    pub fn cancel_import(&self, job_id: &JobId) -> IngestResult<bool> {
        let cancelled = self
            .jobs
            .cancel(job_id)
            .ok_or(IngestError::JobNotFound(*job_id))?;
        if cancelled {
            info!(job = %job_id, "cancellation requested");
        }
        Ok(cancelled)
    }

    /// Remove every product and emit `product.deleted`.
    pub async fn delete_all_products(&self) -> IngestResult<u64> {
        let removed = self.store.delete_all().await?;
        info!(removed, "deleted all products");
        self.events.products_deleted(removed);
        Ok(removed)
    }

    /// Forget finished jobs older than `retention`.
    pub fn prune_finished(&self, retention: chrono::Duration) -> usize {
        self.jobs.prune_finished(retention)
    }

    fn prepare_job(
        &self,
        source: &ImportSource,
        retry_of: Option<JobId>,
    ) -> (JobId, BatchUpserter, JobWriter, tokio_util::sync::CancellationToken) {
        let mut writer = JobWriter::new(Uuid::new_v4(), self.config.max_errors).with_source(
            source.stats.clone(),
            source.declared_size,
            source.expected_rows,
        );
        if let Some(previous) = retry_of {
            writer = writer.with_retry_of(previous);
        }
        let job_id = writer.job_id();
        let cancel = self.jobs.register(&writer);
        let upserter = BatchUpserter::new(
            self.store.clone(),
            self.config.clone(),
            self.events.clone(),
        );
        (job_id, upserter, writer, cancel)
    }
}
