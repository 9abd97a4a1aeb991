//! Streaming product import pipeline.
//!
//! - Line decoding: `csv-async` over any `AsyncRead`, gzip/zstd and non-UTF-8 charsets included.
//! - Batch upserts: case-insensitive SKU keys, last row wins within a batch, bounded retries.
//! - Progress: one single-writer state machine per job, observed through `watch` snapshots.
//! - Events: `product.*` lifecycle events handed off to an external delivery queue.
//!
//! Data shape:
//! - `ImportSource` -> `Importer::start_import` -> `JobId`
//! - `Importer::subscribe(job)` -> `ProgressFeed` of `Arc<JobSnapshot>`
//! - `EventTrigger::channel` -> `mpsc::Receiver<WebhookEvent>`
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod config;
pub mod decoder;
pub mod events;
#[cfg(feature = "fast_local")]
mod fast;
mod io;
pub mod logging;
pub mod model;
pub mod progress;
pub mod service;
pub mod store;
pub mod upsert;

pub use crate::config::{ImportConfig, LogFormat, LoggingConfig};
pub use crate::decoder::{DecodedRow, FieldMap, Header, RowDecoder};
pub use crate::events::{EventTrigger, EventType, WebhookEvent};
#[cfg(feature = "fast_local")]
pub use crate::fast::{count_rows_local, LocalCount};
pub use crate::io::{open_source, ImportSource, SourceMeta, SourceStats};
pub use crate::model::{ProductRecord, RowError, RowErrorKind, SkuKey};
pub use crate::progress::{
    BatchTally, JobId, JobRegistry, JobSnapshot, JobState, JobWriter, ProgressFeed,
    TransitionError,
};
pub use crate::service::Importer;
pub use crate::store::{
    MemoryStore, ProductPage, ProductQuery, RecordStore, StoreError, StoredProduct, UpsertKind,
    UpsertOutcome,
};
pub use crate::upsert::{dedup_last_wins, BatchUpserter};

use thiserror::Error;

/// Why a header line was rejected. Always fatal for the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Input is empty: expected a header line")]
    EmptyHeader,
    #[error("Header line is not valid UTF-8")]
    HeaderEncoding,
    #[error("Header column {0} has an empty name")]
    EmptyColumn(usize),
    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),
    #[error("Missing required column: {0}")]
    MissingColumn(String),
}

/// Error type returned by this crate.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Unknown import job: {0}")]
    JobNotFound(JobId),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
