use async_trait::async_trait;
use product_ingest::{
    EventTrigger, EventType, IngestError, ImportConfig, ImportSource, Importer, JobSnapshot,
    JobState, MemoryStore, ProductPage, ProductQuery, ProductRecord, RecordStore, RowErrorKind,
    SkuKey, SourceMeta, StoreError, StoredProduct, UpsertOutcome,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

fn config(batch_size: usize) -> ImportConfig {
    ImportConfig {
        batch_size,
        retry_backoff_ms: 1,
        ..ImportConfig::default()
    }
}

fn new_importer(store: Arc<dyn RecordStore>, cfg: ImportConfig, events: EventTrigger) -> Importer {
    Importer::new(store, cfg, events).expect("test config is valid")
}

fn csv(rows: impl IntoIterator<Item = String>) -> Vec<u8> {
    let mut out = String::from("sku,name,description,active\n");
    for row in rows {
        out.push_str(&row);
        out.push('\n');
    }
    out.into_bytes()
}

fn numbered(range: std::ops::Range<usize>) -> Vec<u8> {
    csv(range.map(|i| format!("SKU{i:05},Product {i},,")))
}

/// Wraps a [`MemoryStore`]; each write first pops a scripted outcome.
#[derive(Default)]
struct ScriptedStore {
    inner: MemoryStore,
    script: Mutex<VecDeque<Option<StoreError>>>,
    calls: AtomicUsize,
}

impl ScriptedStore {
    fn with_script(script: impl IntoIterator<Item = Option<StoreError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RecordStore for ScriptedStore {
    async fn get(&self, key: &SkuKey) -> Result<Option<StoredProduct>, StoreError> {
        self.inner.get(key).await
    }

    async fn upsert_batch(
        &self,
        records: &[ProductRecord],
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().flatten();
        match next {
            Some(err) => Err(err),
            None => self.inner.upsert_batch(records).await,
        }
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.inner.delete_all().await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }

    async fn query(&self, query: &ProductQuery) -> Result<ProductPage, StoreError> {
        self.inner.query(query).await
    }
}

/// Holds its `gate_at`-th write open until the test releases it.
struct GatedStore {
    inner: MemoryStore,
    calls: AtomicUsize,
    gate_at: usize,
    reached: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl RecordStore for GatedStore {
    async fn get(&self, key: &SkuKey) -> Result<Option<StoredProduct>, StoreError> {
        self.inner.get(key).await
    }

    async fn upsert_batch(
        &self,
        records: &[ProductRecord],
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.gate_at {
            let reached = self.reached.lock().unwrap().take();
            if let Some(tx) = reached {
                let _ = tx.send(());
            }
            let release = self.release.lock().unwrap().take();
            if let Some(rx) = release {
                let _ = rx.await;
            }
        }
        self.inner.upsert_batch(records).await
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.inner.delete_all().await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }

    async fn query(&self, query: &ProductQuery) -> Result<ProductPage, StoreError> {
        self.inner.query(query).await
    }
}

fn assert_balanced(job: &JobSnapshot) {
    assert_eq!(job.rows_succeeded + job.rows_failed, job.rows_seen);
}

#[tokio::test]
async fn later_row_with_other_case_wins() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(1000), EventTrigger::disabled());
    let input = csv(["SKU1,Widget,,".to_string(), "sku1,Widget2,,false".to_string()]);

    let job = importer.run_import(ImportSource::from_bytes(input)).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.rows_seen, 2);
    assert_balanced(&job);
    assert_eq!(store.count().await?, 1);
    let stored = store.get(&SkuKey::normalize("SKU1")).await?.unwrap();
    assert_eq!(stored.record.key.as_str(), "sku1");
    assert_eq!(stored.record.name, "Widget2");
    assert!(!stored.record.active);
    Ok(())
}

#[tokio::test]
async fn keys_differing_in_case_across_batches_collapse() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(1), EventTrigger::disabled());
    let input = csv(["ABC123,First,,".to_string(), "abc123,Second,,".to_string()]);

    let job = importer.run_import(ImportSource::from_bytes(input)).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!((job.rows_created, job.rows_updated), (1, 1));
    assert_eq!(store.count().await?, 1);
    let stored = store.get(&SkuKey::normalize("Abc123")).await?.unwrap();
    assert_eq!(stored.record.name, "Second");
    Ok(())
}

#[tokio::test]
async fn missing_sku_column_fails_without_rows() {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(1000), EventTrigger::disabled());
    let input = b"name,description\nWidget,thing\n".to_vec();

    let job = importer.run_import(ImportSource::from_bytes(input)).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.rows_seen, 0);
    assert_eq!(job.batches_committed, 0);
    assert_eq!(
        job.failure.as_deref(),
        Some("Missing required column: sku")
    );
}

#[tokio::test]
async fn mixed_rows_complete_with_errors() {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(2), EventTrigger::disabled());
    let input = b"sku,name,description,active\n\
        A1,one,,\n\
        \n\
        ,missing,,\n\
        A2,two,,perhaps\n\
        A3,three\n\
        \n\
        A4,four,,yes\n"
        .to_vec();

    let job = importer.run_import(ImportSource::from_bytes(input)).await;

    assert_eq!(job.state, JobState::CompletedWithErrors);
    assert_eq!(job.rows_seen, 5);
    assert_eq!(job.rows_succeeded, 2);
    assert_eq!(job.rows_failed, 3);
    assert_balanced(&job);
    let reasons: Vec<_> = job.errors.iter().map(|e| (e.ordinal, e.reason)).collect();
    assert_eq!(
        reasons,
        [
            (3, RowErrorKind::MissingKey),
            (4, RowErrorKind::InvalidField),
            (5, RowErrorKind::ColumnCount),
        ]
    );
    assert_eq!(job.errors[0].line, 4);
    assert!(job.error_summary().starts_with("3 of 5 rows failed"));
}

#[tokio::test]
async fn every_row_failing_fails_the_job() {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());
    let input = csv([",a,,".to_string(), " ,b,,".to_string()]);

    let job = importer.run_import(ImportSource::from_bytes(input)).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.rows_failed, 2);
    assert!(job.failure.is_none());
    assert_balanced(&job);
}

#[tokio::test]
async fn header_only_input_completes_empty() {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store, config(10), EventTrigger::disabled());

    let job = importer
        .run_import(ImportSource::from_bytes(b"sku,name\n".to_vec()))
        .await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.rows_seen, 0);
    assert_eq!(job.percent(), 100);
}

#[tokio::test]
async fn transient_write_failures_are_retried() -> anyhow::Result<()> {
    let store = Arc::new(ScriptedStore::with_script([
        Some(StoreError::Write("deadlock".into())),
        Some(StoreError::Write("deadlock".into())),
    ]));
    let importer = new_importer(store.clone(), config(100), EventTrigger::disabled());

    let job = importer.run_import(ImportSource::from_bytes(numbered(0..50))).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.rows_succeeded, 50);
    assert_eq!(job.errors_total, 0);
    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.count().await?, 50);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_demote_batch_and_continue() -> anyhow::Result<()> {
    // first batch fails on all 4 attempts, second batch goes through
    let store = Arc::new(ScriptedStore::with_script(
        (0..4).map(|_| Some(StoreError::Write("constraint".into()))),
    ));
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());

    let job = importer.run_import(ImportSource::from_bytes(numbered(0..20))).await;

    assert_eq!(job.state, JobState::CompletedWithErrors);
    assert_eq!((job.rows_succeeded, job.rows_failed), (10, 10));
    assert_eq!(job.batches_committed, 1);
    assert!(job.errors.iter().all(|e| e.reason == RowErrorKind::StoreWrite));
    assert_eq!(job.errors[0].ordinal, 2);
    assert_eq!(store.calls.load(Ordering::SeqCst), 5);
    assert!(store.get(&SkuKey::normalize("SKU00000")).await?.is_none());
    assert!(store.get(&SkuKey::normalize("SKU00015")).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn unreachable_store_fails_the_job() {
    let store = Arc::new(ScriptedStore::with_script(
        (0..4).map(|_| Some(StoreError::Unavailable("connection refused".into()))),
    ));
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());

    let job = importer.run_import(ImportSource::from_bytes(numbered(0..30))).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.rows_seen, 10);
    assert_eq!(job.rows_failed, 10);
    assert_eq!(job.rows_succeeded, 0);
    assert!(job
        .failure
        .as_deref()
        .is_some_and(|f| f.contains("connection refused")));
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn cancellation_stops_at_batch_boundary() -> anyhow::Result<()> {
    let (reached_tx, reached_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        calls: AtomicUsize::new(0),
        gate_at: 3,
        reached: Mutex::new(Some(reached_tx)),
        release: Mutex::new(Some(release_rx)),
    });
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());

    let job_id = importer.start_import(ImportSource::from_bytes(numbered(0..100)));
    let feed = importer.subscribe(&job_id).unwrap();

    reached_rx.await?;
    assert!(importer.cancel_import(&job_id)?);
    release_tx.send(()).unwrap();

    let job = feed.wait_for_terminal().await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure.as_deref(), Some("import cancelled"));
    assert_eq!(job.batches_committed, 3);
    assert_eq!(job.rows_succeeded, 30);
    assert_balanced(&job);
    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.count().await?, 30);

    assert!(!importer.cancel_import(&job_id)?);
    Ok(())
}

#[tokio::test]
async fn cancelling_unknown_job_is_an_error() {
    let importer = new_importer(
        Arc::new(MemoryStore::new()),
        config(10),
        EventTrigger::disabled(),
    );
    let err = importer.cancel_import(&uuid::Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, IngestError::JobNotFound(_)));
}

#[tokio::test]
async fn reimport_is_idempotent() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(7), EventTrigger::disabled());
    let input = csv((0..40).map(|i| format!("sku-{},Item {i},desc {i},{}", i % 25, i % 3 == 0)));

    let first = importer.run_import(ImportSource::from_bytes(input.clone())).await;
    let after_first = store.fingerprint().await;
    let second = importer.run_import(ImportSource::from_bytes(input)).await;

    assert_eq!(first.state, JobState::Completed);
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(store.fingerprint().await, after_first);
    assert_eq!(store.count().await?, 25);
    assert_eq!(second.rows_created, 0);
    assert!(second.rows_updated > 0);
    Ok(())
}

#[tokio::test]
async fn progress_feed_is_monotonic() {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store, config(5), EventTrigger::disabled());
    let source = ImportSource::from_bytes(numbered(0..200)).with_expected_rows(200);

    let job_id = importer.start_import(source);
    let mut feed = importer.subscribe(&job_id).unwrap();

    let mut snapshots = Vec::new();
    while let Some(snapshot) = feed.next().await {
        snapshots.push(snapshot);
    }

    let last = snapshots.last().unwrap();
    assert_eq!(last.state, JobState::Completed);
    assert_eq!(last.percent(), 100);
    for pair in snapshots.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(b.version > a.version);
        assert!(a.state == b.state || a.state.can_advance_to(b.state));
        assert!(b.rows_seen >= a.rows_seen);
        assert!(b.rows_succeeded >= a.rows_succeeded);
        assert!(b.rows_failed >= a.rows_failed);
        assert!(b.percent() >= a.percent());
    }
    assert_eq!(
        importer.get_progress(&job_id).unwrap().version,
        last.version
    );
}

#[tokio::test]
async fn lifecycle_events_reach_the_queue() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (events, mut rx) = EventTrigger::channel(64);
    for event_type in EventType::ALL {
        events.subscribe(event_type);
    }
    let importer = new_importer(store.clone(), config(2), events);
    store
        .upsert_batch(&[ProductRecord::new("OLD1", "existing")])
        .await?;

    let input = csv(["old1,renamed,,".to_string(), "NEW1,fresh,,".to_string(), ",bad,,".to_string()]);
    let job = importer.run_import(ImportSource::from_bytes(input)).await;
    assert_eq!(job.state, JobState::CompletedWithErrors);

    let removed = importer.delete_all_products().await?;
    assert_eq!(removed, 2);

    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event);
    }
    let types: Vec<_> = received.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        [
            EventType::ProductUpdated,
            EventType::ProductCreated,
            EventType::ProductImported,
            EventType::ProductDeleted,
        ]
    );
    assert_eq!(received[0].payload["sku"], "old1");
    assert_eq!(received[2].payload["job_id"], job.job_id.to_string());
    assert_eq!(received[2].payload["count"], 2);
    assert_eq!(received[2].payload["created"], 1);
    assert_eq!(received[2].payload["updated"], 1);
    assert_eq!(received[2].payload["errors"], 1);
    assert_eq!(received[3].payload["count"], 2);
    Ok(())
}

#[tokio::test]
async fn failed_jobs_emit_no_import_event() {
    let (events, mut rx) = EventTrigger::channel(8);
    events.subscribe(EventType::ProductImported);
    let importer = new_importer(Arc::new(MemoryStore::new()), config(10), events);

    let job = importer
        .run_import(ImportSource::from_bytes(b"name\nx\n".to_vec()))
        .await;

    assert_eq!(job.state, JobState::Failed);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn retry_is_a_new_linked_job() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());

    let first = importer.start_import(ImportSource::from_bytes(b"name\nx\n".to_vec()));
    let failed = importer.subscribe(&first).unwrap().wait_for_terminal().await;
    assert_eq!(failed.state, JobState::Failed);

    let second = importer.retry_import(first, ImportSource::from_bytes(numbered(0..3)));
    assert_ne!(first, second);
    let done = importer.subscribe(&second).unwrap().wait_for_terminal().await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.retry_of, Some(first));
    assert_eq!(
        importer.get_progress(&first).unwrap().state,
        JobState::Failed
    );

    assert_eq!(importer.prune_finished(chrono::Duration::zero()), 2);
    assert!(importer.get_progress(&first).is_none());
    Ok(())
}

#[tokio::test]
async fn retry_after_prune_still_starts_a_job() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());

    let failed = importer
        .run_import(ImportSource::from_bytes(b"name\nx\n".to_vec()))
        .await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(importer.prune_finished(chrono::Duration::zero()), 1);

    let retried = importer.retry_import(failed.job_id, ImportSource::from_bytes(numbered(0..4)));
    let done = importer.subscribe(&retried).unwrap().wait_for_terminal().await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.rows_succeeded, 4);
    assert_eq!(done.retry_of, None);
    assert_eq!(store.count().await?, 4);
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected_up_front() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let too_small = ImportConfig {
        chunk_size: 0,
        ..ImportConfig::default()
    };
    let err = Importer::new(store.clone(), too_small, EventTrigger::disabled()).err();
    assert!(matches!(err, Some(IngestError::Config(msg)) if msg.contains("chunk_size")));

    let no_batch = ImportConfig {
        batch_size: 0,
        ..ImportConfig::default()
    };
    assert!(Importer::new(store, no_batch, EventTrigger::disabled()).is_err());
}

#[tokio::test]
async fn cancel_after_final_full_batch_still_completes() -> anyhow::Result<()> {
    let (reached_tx, reached_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        calls: AtomicUsize::new(0),
        gate_at: 3,
        reached: Mutex::new(Some(reached_tx)),
        release: Mutex::new(Some(release_rx)),
    });
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());

    // exactly three full batches, so the third write is the last one
    let job_id = importer.start_import(ImportSource::from_bytes(numbered(0..30)));
    let feed = importer.subscribe(&job_id).unwrap();

    reached_rx.await?;
    assert!(importer.cancel_import(&job_id)?);
    release_tx.send(()).unwrap();

    let job = feed.wait_for_terminal().await;
    assert_eq!(job.state, JobState::Completed);
    assert!(job.failure.is_none());
    assert_eq!(job.rows_succeeded, 30);
    assert_eq!(job.batches_committed, 3);
    Ok(())
}

/// A store whose writes always panic.
struct PanickingStore;

#[async_trait]
impl RecordStore for PanickingStore {
    async fn get(&self, _key: &SkuKey) -> Result<Option<StoredProduct>, StoreError> {
        Ok(None)
    }

    async fn upsert_batch(
        &self,
        _records: &[ProductRecord],
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        panic!("connection pool poisoned");
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn query(&self, query: &ProductQuery) -> Result<ProductPage, StoreError> {
        MemoryStore::new().query(query).await
    }
}

#[tokio::test]
async fn panicking_store_still_ends_the_job() {
    let importer = new_importer(Arc::new(PanickingStore), config(10), EventTrigger::disabled());

    let job_id = importer.start_import(ImportSource::from_bytes(numbered(0..5)));
    let job = importer.subscribe(&job_id).unwrap().wait_for_terminal().await;

    assert_eq!(job.state, JobState::Failed);
    assert!(job
        .failure
        .as_deref()
        .is_some_and(|f| f.contains("connection pool poisoned")));
    assert!(importer.get_progress(&job_id).unwrap().is_terminal());
    assert!(!importer.cancel_import(&job_id).unwrap());
}

#[tokio::test]
async fn legacy_charset_is_transcoded() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let importer = new_importer(store.clone(), config(10), EventTrigger::disabled());
    let meta = SourceMeta {
        charset: encoding_rs::WINDOWS_1252,
        ..SourceMeta::from_name("latin1.csv")
    };
    let raw: &'static [u8] = b"sku,name\nC1,Caf\xe9 cr\xe8me\n";

    let job = importer.run_import(ImportSource::new(raw, meta)).await;

    assert_eq!(job.state, JobState::Completed);
    let stored = store.get(&SkuKey::normalize("c1")).await?.unwrap();
    assert_eq!(stored.record.name, "Café crème");
    Ok(())
}

#[tokio::test]
async fn extra_columns_become_attributes_and_required_columns_are_enforced() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config(10);
    cfg.required_columns = vec!["sku".into(), "name".into()];
    let importer = new_importer(store.clone(), cfg, EventTrigger::disabled());
    let input = b"SKU,Name,Color,Weight\nP1,Pen,blue,10g\nP2,,red,5g\n".to_vec();

    let job = importer.run_import(ImportSource::from_bytes(input)).await;

    assert_eq!(job.state, JobState::CompletedWithErrors);
    assert_eq!(job.errors[0].reason, RowErrorKind::MissingField);
    let pen = store.get(&SkuKey::normalize("p1")).await?.unwrap();
    assert_eq!(pen.record.attributes.get("color").map(String::as_str), Some("blue"));
    assert_eq!(pen.record.attributes.get("weight").map(String::as_str), Some("10g"));
    assert!(pen.record.active);

    let page = store
        .query(&ProductQuery {
            search: Some("pen".into()),
            ..Default::default()
        })
        .await?;
    assert_eq!(page.total, 1);
    Ok(())
}

/// Generates `rows` products on the fly and counts the bytes handed out.
struct SyntheticCsv {
    next_row: u64,
    rows: u64,
    pending: Vec<u8>,
    offset: usize,
    produced: Arc<std::sync::atomic::AtomicU64>,
}

const SYNTHETIC_HEADER: &[u8] = b"sku,name,description,active\n";
const SYNTHETIC_ROW_LEN: u64 = 39;

impl tokio::io::AsyncRead for SyntheticCsv {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = &mut *self;
        while buf.remaining() > 0 {
            if this.offset == this.pending.len() {
                if this.next_row == this.rows {
                    break;
                }
                this.pending.clear();
                this.offset = 0;
                let i = this.next_row;
                this.pending
                    .extend_from_slice(format!("SKU{i:010},Product {i:010},,true\n").as_bytes());
                this.next_row += 1;
            }
            let n = buf.remaining().min(this.pending.len() - this.offset);
            buf.put_slice(&this.pending[this.offset..this.offset + n]);
            this.offset += n;
            this.produced.fetch_add(n as u64, Ordering::SeqCst);
        }
        std::task::Poll::Ready(Ok(()))
    }
}

/// Notes how far the source had been read at every write.
struct ReadAheadStore {
    inner: MemoryStore,
    produced: Arc<std::sync::atomic::AtomicU64>,
    calls: Mutex<Vec<(usize, u64)>>,
}

#[async_trait]
impl RecordStore for ReadAheadStore {
    async fn get(&self, key: &SkuKey) -> Result<Option<StoredProduct>, StoreError> {
        self.inner.get(key).await
    }

    async fn upsert_batch(
        &self,
        records: &[ProductRecord],
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let produced = self.produced.load(Ordering::SeqCst);
        self.calls.lock().unwrap().push((records.len(), produced));
        self.inner.upsert_batch(records).await
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.inner.delete_all().await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }

    async fn query(&self, query: &ProductQuery) -> Result<ProductPage, StoreError> {
        self.inner.query(query).await
    }
}

#[tokio::test]
async fn large_input_is_read_in_bounded_steps() -> anyhow::Result<()> {
    const ROWS: u64 = 500_000;
    let produced = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let source = SyntheticCsv {
        next_row: 0,
        rows: ROWS,
        pending: SYNTHETIC_HEADER.to_vec(),
        offset: 0,
        produced: produced.clone(),
    };
    let store = Arc::new(ReadAheadStore {
        inner: MemoryStore::new(),
        produced: produced.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let mut cfg = config(5000);
    cfg.chunk_size = 64 * 1024;
    let chunk_size = cfg.chunk_size as u64;
    let importer = new_importer(store.clone(), cfg, EventTrigger::disabled());

    let job = importer
        .run_import(ImportSource::new(source, SourceMeta::from_name("synthetic.csv")))
        .await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.rows_succeeded, ROWS);
    assert_eq!(job.batches_committed, ROWS / 5000);
    assert_eq!(store.count().await?, ROWS);

    let calls = store.calls.lock().unwrap().clone();
    assert_eq!(calls.len() as u64, ROWS / 5000);
    let mut consumed = SYNTHETIC_HEADER.len() as u64;
    for (records, produced_at_write) in calls {
        assert!(records <= 5000);
        consumed += records as u64 * SYNTHETIC_ROW_LEN;
        let read_ahead = produced_at_write.saturating_sub(consumed);
        assert!(
            read_ahead < 2 * 1024 * 1024 + chunk_size,
            "read {read_ahead} bytes past the batch being written"
        );
    }
    assert_eq!(
        produced.load(Ordering::SeqCst),
        SYNTHETIC_HEADER.len() as u64 + ROWS * SYNTHETIC_ROW_LEN
    );
    Ok(())
}
