//! Batch upserter: turns decoded rows into validated, de-duplicated batches
//! and applies them to the record store one batch at a time.
//!
//! Two separate overwrite rules apply:
//! - within a batch, the later row for a key supersedes earlier ones ([`dedup_last_wins`]);
//! - across batches and jobs, the store replaces an existing key's record wholesale.

use crate::config::ImportConfig;
use crate::decoder::{DecodedRow, FieldMap, RowDecoder};
use crate::events::{EventTrigger, EventType};
use crate::io::ImportSource;
use crate::model::{
    parse_active, ProductRecord, RowError, RowErrorKind, SkuKey, MAX_NAME_LEN, MAX_SKU_LEN,
};
use crate::progress::{BatchTally, JobId, JobSnapshot, JobState, JobWriter};
use crate::store::{RecordStore, StoreError, UpsertKind, UpsertOutcome};
use crate::{IngestError, IngestResult};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Columns mapped onto [`ProductRecord`] fields; everything else becomes an attribute.
const RECOGNIZED_COLUMNS: [&str; 4] = ["sku", "name", "description", "active"];

/// Message recorded as the failure of a cancelled job.
pub const CANCELLED: &str = "import cancelled";

/// Decoded, validated rows of one batch.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    /// Valid records in file order, duplicates included.
    pub records: Vec<ProductRecord>,
    /// `(ordinal, line)` of each entry in `records`.
    origins: Vec<(u64, u64)>,
    pub errors: Vec<RowError>,
    pub rows: u64,
    pub last_line: u64,
}

/// Keep only the last record for each key, preserving file order of the survivors.
pub fn dedup_last_wins(records: &[ProductRecord]) -> Vec<ProductRecord> {
    let mut seen: HashSet<&SkuKey> = HashSet::with_capacity(records.len());
    let mut kept: Vec<ProductRecord> = records
        .iter()
        .rev()
        .filter(|r| seen.insert(&r.key))
        .cloned()
        .collect();
    kept.reverse();
    kept
}

/// Map one row's fields onto a record, validating as we go.
pub fn row_to_record(
    fields: &FieldMap,
    required: &[String],
    ordinal: u64,
    line: u64,
) -> Result<ProductRecord, RowError> {
    let fail = |reason, message: String| RowError::new(ordinal, line, fields.excerpt(), reason, message);

    let sku = fields.get("sku").unwrap_or_default().trim();
    if sku.is_empty() {
        return Err(fail(RowErrorKind::MissingKey, "SKU is empty".to_string()));
    }
    if sku.chars().count() > MAX_SKU_LEN {
        return Err(fail(
            RowErrorKind::FieldTooLong,
            format!("SKU is longer than {MAX_SKU_LEN} characters"),
        ));
    }

    for column in required {
        let value = fields.get(column).unwrap_or_default();
        if value.trim().is_empty() {
            return Err(fail(
                RowErrorKind::MissingField,
                format!("SKU {sku}: column '{}' is empty", column.trim().to_lowercase()),
            ));
        }
    }

    let name = fields.get("name").unwrap_or_default().trim();
    if name.chars().count() > MAX_NAME_LEN {
        return Err(fail(
            RowErrorKind::FieldTooLong,
            format!("SKU {sku}: name is longer than {MAX_NAME_LEN} characters"),
        ));
    }

    let raw_active = fields.get("active").unwrap_or_default();
    let Some(active) = parse_active(raw_active) else {
        return Err(fail(
            RowErrorKind::InvalidField,
            format!("SKU {sku}: '{}' is not a valid value for 'active'", raw_active.trim()),
        ));
    };

    let mut record = ProductRecord::new(sku, name)
        .with_description(fields.get("description").unwrap_or_default().trim())
        .with_active(active);
    for (column, value) in fields.iter() {
        if !RECOGNIZED_COLUMNS.contains(&column) {
            record.attributes.insert(column.to_string(), value.trim().to_string());
        }
    }
    Ok(record)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// How the row loop ended, when it ended without a fatal error.
enum Flow {
    Finished,
    Cancelled,
}

/// Applies one job's rows to the store. Batches run strictly one after another.
#[derive(Clone)]
pub struct BatchUpserter {
    store: Arc<dyn RecordStore>,
    config: Arc<ImportConfig>,
    events: EventTrigger,
}

impl BatchUpserter {
    pub fn new(store: Arc<dyn RecordStore>, config: Arc<ImportConfig>, events: EventTrigger) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Run a whole job to its terminal state, publishing through `writer`.
    ///
    /// `cancel` is checked before each batch is written; batches already written
    /// stay written. A panic inside the pipeline (a store implementation, say)
    /// still ends the job `failed`.
    pub async fn run(
        &self,
        source: ImportSource,
        mut writer: JobWriter,
        cancel: CancellationToken,
    ) -> Arc<JobSnapshot> {
        let job_id = writer.job_id();
        let stats = source.stats.clone();
        info!(job = %job_id, source = %source.meta.name_hint, "import started");

        let driven = AssertUnwindSafe(self.drive(source.reader, &mut writer, &cancel))
            .catch_unwind()
            .await;
        let failure = match driven {
            Ok(Ok(Flow::Finished)) => None,
            Ok(Ok(Flow::Cancelled)) => {
                info!(job = %job_id, "import cancelled at batch boundary");
                Some(CANCELLED.to_string())
            }
            Ok(Err(err)) => {
                warn!(job = %job_id, error = %err, "import failed");
                Some(err.to_string())
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                error!(job = %job_id, panic = %reason, "import task panicked");
                Some(format!("import task panicked: {reason}"))
            }
        };

        if stats.replaced_sequences() > 0 {
            warn!(
                job = %job_id,
                chunks = stats.replaced_sequences(),
                "malformed input bytes were replaced while transcoding"
            );
        }

        let job = writer.finish(failure);
        info!(
            job = %job_id,
            state = %job.state,
            rows_seen = job.rows_seen,
            rows_succeeded = job.rows_succeeded,
            rows_failed = job.rows_failed,
            "import finished"
        );
        self.events.job_finished(&job);
        job
    }

    async fn drive<R>(
        &self,
        reader: R,
        writer: &mut JobWriter,
        cancel: &CancellationToken,
    ) -> IngestResult<Flow>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut decoder = RowDecoder::open(
            reader,
            &self.config.required_columns,
            self.config.chunk_size,
        )
        .await?;
        writer.advance(JobState::Parsing)?;

        let batch_size = self.config.batch_size.max(1);
        loop {
            let mut rows = Vec::with_capacity(batch_size);
            let mut read_error = None;
            while rows.len() < batch_size {
                match decoder.next_row().await {
                    Ok(Some(row)) => rows.push(row),
                    Ok(None) => break,
                    Err(err) => {
                        read_error = Some(err);
                        break;
                    }
                }
            }
            let exhausted = rows.len() < batch_size;

            if rows.is_empty() {
                return match read_error {
                    Some(err) => Err(err),
                    None => Ok(Flow::Finished),
                };
            }
            // Only a batch that would actually be written is abandoned.
            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            if writer.snapshot().state == JobState::Parsing {
                writer.advance(JobState::Importing)?;
            }
            let batch = self.prepare(rows);
            let (tally, fatal) = self.apply(writer.job_id(), batch).await;
            writer.record_batch(tally);
            if let Some(err) = fatal {
                return Err(err);
            }

            if let Some(err) = read_error {
                return Err(err);
            }
            if exhausted {
                return Ok(Flow::Finished);
            }
        }
    }

    /// Normalize and validate a batch of decoded rows.
    pub fn prepare(&self, rows: Vec<DecodedRow>) -> PreparedBatch {
        let mut batch = PreparedBatch {
            records: Vec::with_capacity(rows.len()),
            origins: Vec::with_capacity(rows.len()),
            ..Default::default()
        };
        for row in rows {
            batch.rows += 1;
            batch.last_line = batch.last_line.max(row.line);
            let record = row.fields.and_then(|fields| {
                row_to_record(&fields, &self.config.required_columns, row.ordinal, row.line)
            });
            match record {
                Ok(record) => {
                    batch.records.push(record);
                    batch.origins.push((row.ordinal, row.line));
                }
                Err(err) => batch.errors.push(err),
            }
        }
        batch
    }

    /// Write a prepared batch and report what happened to every row in it.
    ///
    /// The second value is set when the store stayed unreachable past the retry bound.
    pub async fn apply(&self, job_id: JobId, batch: PreparedBatch) -> (BatchTally, Option<IngestError>) {
        let mut tally = BatchTally {
            rows: batch.rows,
            failed: batch.errors.len() as u64,
            errors: batch.errors,
            last_line: batch.last_line,
            ..Default::default()
        };
        if batch.records.is_empty() {
            tally.committed = true;
            return (tally, None);
        }

        let write_set = dedup_last_wins(&batch.records);
        match self.write_with_retry(&write_set).await {
            Ok(outcomes) => {
                tally.committed = true;
                tally.succeeded = batch.records.len() as u64;
                self.count_outcomes(job_id, &write_set, &outcomes, &mut tally);
                debug!(
                    job = %job_id,
                    rows = tally.rows,
                    written = write_set.len(),
                    created = tally.created,
                    updated = tally.updated,
                    "batch committed"
                );
                (tally, None)
            }
            Err(err) => {
                let (reason, fatal) = match &err {
                    StoreError::Write(_) => (RowErrorKind::StoreWrite, None),
                    StoreError::Unavailable(msg) => (
                        RowErrorKind::StoreUnavailable,
                        Some(IngestError::StoreUnavailable(msg.clone())),
                    ),
                };
                warn!(
                    job = %job_id,
                    rows = batch.records.len(),
                    error = %err,
                    "batch write gave up after retries, rows recorded as errors"
                );
                tally.failed += batch.records.len() as u64;
                for (record, (ordinal, line)) in batch.records.iter().zip(batch.origins) {
                    tally.errors.push(RowError::new(
                        ordinal,
                        line,
                        record.excerpt(),
                        reason,
                        format!("SKU {}: {err}", record.sku),
                    ));
                }
                (tally, fatal)
            }
        }
    }

    async fn write_with_retry(
        &self,
        records: &[ProductRecord],
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.upsert_batch(records).await {
                Ok(outcomes) => return Ok(outcomes),
                Err(err) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "batch write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn count_outcomes(
        &self,
        job_id: JobId,
        write_set: &[ProductRecord],
        outcomes: &[UpsertOutcome],
        tally: &mut BatchTally,
    ) {
        let notify = self.events.is_subscribed(EventType::ProductCreated)
            || self.events.is_subscribed(EventType::ProductUpdated);
        for (record, outcome) in write_set.iter().zip(outcomes) {
            match outcome.kind {
                UpsertKind::Created => tally.created += 1,
                UpsertKind::Updated => tally.updated += 1,
            }
            if notify {
                self.events.record_upserted(job_id, record, outcome.kind);
            }
        }
    }
}
