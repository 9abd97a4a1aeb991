//! Per-job progress: the state machine, its single writer and its readers.
//!
//! A job's observable state is an immutable [`JobSnapshot`] published through a
//! `tokio::sync::watch` channel. Only the [`JobWriter`] can publish, and it
//! publishes whole snapshots, so readers never see a half-applied batch.

use crate::io::SourceStats;
use crate::model::RowError;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Uploading,
    Parsing,
    Importing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobState {
    fn stage(self) -> u8 {
        match self {
            Self::Uploading => 0,
            Self::Parsing => 1,
            Self::Importing => 2,
            Self::Completed | Self::CompletedWithErrors | Self::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.stage() == 3
    }

    /// States only move forward, and never out of a terminal state.
    pub fn can_advance_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.stage() > self.stage()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Parsing => "parsing",
            Self::Importing => "importing",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// Point-in-time copy of an import job's observable fields.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    /// Job this one re-submits, if any.
    pub retry_of: Option<JobId>,
    /// Bumped on every publish.
    pub version: u64,
    pub state: JobState,
    pub declared_size: Option<u64>,
    pub bytes_received: u64,
    pub expected_rows: Option<u64>,
    pub rows_seen: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub rows_created: u64,
    pub rows_updated: u64,
    pub batches_committed: u64,
    /// Physical source line of the last row of the last finished batch.
    pub resume_line: u64,
    pub errors: Vec<RowError>,
    pub errors_total: u64,
    pub errors_truncated: bool,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    fn new(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            retry_of: None,
            version: 0,
            state: JobState::Uploading,
            declared_size: None,
            bytes_received: 0,
            expected_rows: None,
            rows_seen: 0,
            rows_succeeded: 0,
            rows_failed: 0,
            rows_created: 0,
            rows_updated: 0,
            batches_committed: 0,
            resume_line: 0,
            errors: Vec::new(),
            errors_total: 0,
            errors_truncated: false,
            failure: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn processed(&self) -> u64 {
        self.rows_succeeded + self.rows_failed
    }

    /// Whole percent complete, 0..=100.
    pub fn percent(&self) -> u8 {
        let processed = self.processed();
        let denominator = self.expected_rows.unwrap_or(processed).max(processed);
        if denominator == 0 {
            return if self.is_terminal() { 100 } else { 0 };
        }
        (processed * 100 / denominator) as u8
    }

    /// "N of M rows failed" followed by the kept error messages.
    pub fn error_summary(&self) -> String {
        if self.errors_total == 0 {
            return String::new();
        }
        let mut out = format!("{} of {} rows failed", self.rows_failed, self.rows_seen);
        for err in &self.errors {
            out.push_str("\n- ");
            out.push_str(&err.to_string());
        }
        if self.errors_truncated {
            let hidden = self.errors_total - self.errors.len() as u64;
            out.push_str(&format!("\n... and {hidden} more errors"));
        }
        out
    }
}

/// What one batch did, applied to the counters as a unit.
#[derive(Debug, Clone, Default)]
pub struct BatchTally {
    pub rows: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub created: u64,
    pub updated: u64,
    pub errors: Vec<RowError>,
    pub last_line: u64,
    /// The store accepted the batch's write set (or it had none).
    pub committed: bool,
}

/// The only handle that can change a job. Not `Clone`.
///
/// Dropping the writer closes every [`ProgressFeed`] after its last snapshot.
pub struct JobWriter {
    current: JobSnapshot,
    tx: watch::Sender<Arc<JobSnapshot>>,
    max_errors: usize,
    source: Option<SourceStats>,
}

impl JobWriter {
    pub fn new(job_id: JobId, max_errors: usize) -> Self {
        let current = JobSnapshot::new(job_id);
        let (tx, _rx) = watch::channel(Arc::new(current.clone()));
        Self {
            current,
            tx,
            max_errors,
            source: None,
        }
    }

    pub fn with_retry_of(mut self, previous: JobId) -> Self {
        self.current.retry_of = Some(previous);
        self.publish();
        self
    }

    /// Attach what is known about the input before any byte is read.
    pub fn with_source(
        mut self,
        stats: SourceStats,
        declared_size: Option<u64>,
        expected_rows: Option<u64>,
    ) -> Self {
        self.source = Some(stats);
        self.current.declared_size = declared_size;
        self.current.expected_rows = expected_rows;
        self.publish();
        self
    }

    pub fn job_id(&self) -> JobId {
        self.current.job_id
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.current
    }

    pub fn subscribe(&self) -> ProgressFeed {
        ProgressFeed::new(self.tx.subscribe())
    }

    /// Move to a later non-terminal state. Use [`JobWriter::finish`] to end the job.
    pub fn advance(&mut self, to: JobState) -> Result<(), TransitionError> {
        if to.is_terminal() || !self.current.state.can_advance_to(to) {
            return Err(TransitionError {
                from: self.current.state,
                to,
            });
        }
        self.current.state = to;
        self.publish();
        Ok(())
    }

    pub fn record_batch(&mut self, tally: BatchTally) {
        let job = &mut self.current;
        job.rows_seen += tally.rows;
        job.rows_succeeded += tally.succeeded;
        job.rows_failed += tally.failed;
        job.rows_created += tally.created;
        job.rows_updated += tally.updated;
        if tally.committed {
            job.batches_committed += 1;
        }
        job.resume_line = job.resume_line.max(tally.last_line);

        job.errors_total += tally.errors.len() as u64;
        let room = self.max_errors.saturating_sub(job.errors.len());
        job.errors.extend(tally.errors.into_iter().take(room));
        job.errors_truncated = job.errors_total > job.errors.len() as u64;

        self.publish();
    }

    /// Pick and publish the terminal state.
    ///
    /// Any `failure` (fatal error or cancellation) ends the job `failed`;
    /// otherwise the outcome follows from the row counters.
    pub fn finish(mut self, failure: Option<String>) -> Arc<JobSnapshot> {
        let job = &mut self.current;
        job.state = match (&failure, job.rows_succeeded, job.rows_failed) {
            (Some(_), _, _) => JobState::Failed,
            (None, _, 0) => JobState::Completed,
            (None, 0, _) => JobState::Failed,
            (None, _, _) => JobState::CompletedWithErrors,
        };
        job.failure = failure;
        job.finished_at = Some(Utc::now());
        self.publish();
        self.tx.borrow().clone()
    }

    fn publish(&mut self) {
        let job = &mut self.current;
        job.version += 1;
        job.updated_at = Utc::now();
        if let Some(stats) = &self.source {
            job.bytes_received = job.bytes_received.max(stats.bytes_received());
        }
        self.tx.send_replace(Arc::new(job.clone()));
    }
}

/// Reader side of a job: the current snapshot first, then every newer one,
/// ending after the terminal snapshot.
///
/// Intermediate snapshots may be coalesced; counters and state in the ones
/// delivered never go backwards.
pub struct ProgressFeed {
    rx: watch::Receiver<Arc<JobSnapshot>>,
    seen_version: Option<u64>,
    finished: bool,
}

impl ProgressFeed {
    fn new(rx: watch::Receiver<Arc<JobSnapshot>>) -> Self {
        Self {
            rx,
            seen_version: None,
            finished: false,
        }
    }

    pub fn current(&self) -> Arc<JobSnapshot> {
        self.rx.borrow().clone()
    }

    pub async fn next(&mut self) -> Option<Arc<JobSnapshot>> {
        if self.finished {
            return None;
        }
        if self.seen_version.is_some() && self.rx.changed().await.is_err() {
            // Writer gone; hand out its final snapshot if we have not yet.
            let last = self.rx.borrow().clone();
            if Some(last.version) == self.seen_version {
                self.finished = true;
                return None;
            }
            return Some(self.deliver(last));
        }
        let snapshot = self.rx.borrow_and_update().clone();
        Some(self.deliver(snapshot))
    }

    /// Follow the feed to its end and return the last snapshot seen.
    pub async fn wait_for_terminal(mut self) -> Arc<JobSnapshot> {
        let mut last = self.current();
        while let Some(snapshot) = self.next().await {
            last = snapshot;
        }
        last
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<JobSnapshot>> {
        stream::unfold(self, |mut feed| async move {
            let snapshot = feed.next().await?;
            Some((snapshot, feed))
        })
    }

    fn deliver(&mut self, snapshot: Arc<JobSnapshot>) -> Arc<JobSnapshot> {
        self.seen_version = Some(snapshot.version);
        self.finished = snapshot.is_terminal();
        snapshot
    }
}

struct JobEntry {
    feed: watch::Receiver<Arc<JobSnapshot>>,
    cancel: CancellationToken,
}

/// Job id -> latest snapshot and cancellation token, for every job not yet pruned.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job and hand back the token its pipeline must poll.
    pub fn register(&self, writer: &JobWriter) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.write().insert(
            writer.job_id(),
            JobEntry {
                feed: writer.tx.subscribe(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn snapshot(&self, job_id: &JobId) -> Option<Arc<JobSnapshot>> {
        self.read().get(job_id).map(|entry| entry.feed.borrow().clone())
    }

    pub fn subscribe(&self, job_id: &JobId) -> Option<ProgressFeed> {
        self.read()
            .get(job_id)
            .map(|entry| ProgressFeed::new(entry.feed.clone()))
    }

    /// `None` for an unknown job, `Some(false)` if it already finished.
    pub fn cancel(&self, job_id: &JobId) -> Option<bool> {
        let jobs = self.read();
        let entry = jobs.get(job_id)?;
        if entry.feed.borrow().is_terminal() {
            return Some(false);
        }
        entry.cancel.cancel();
        Some(true)
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    pub fn prune_finished(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let snapshot = entry.feed.borrow();
            !matches!(snapshot.finished_at, Some(at) if at <= cutoff)
        });
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}
