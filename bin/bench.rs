use clap::{Arg, ArgAction, Command};
use product_ingest::{
    logging, EventTrigger, EventType, ImportConfig, ImportSource, Importer, JobSnapshot,
    MemoryStore, RecordStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("bench")
        .about("Import a product CSV into an in-memory store and report throughput")
        .arg(Arg::new("path").long("path").required(true).value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("config").long("config").help("TOML file with import settings").value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("batch-size").long("batch-size").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("require").long("require").help("Additional required column").action(ArgAction::Append))
        .arg(Arg::new("verify").long("verify").help("Import twice and check the store ends up identical").action(ArgAction::SetTrue))
        .arg(Arg::new("events").long("events").help("Subscribe to every event type and count deliveries").action(ArgAction::SetTrue))
        .arg(Arg::new("fast-local").long("fast-local").help("Pre-count rows with mmap for an exact percentage (feature: fast_local)").action(ArgAction::SetTrue))
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => ImportConfig::load(path)?,
        None => ImportConfig::default(),
    };
    if let Some(batch_size) = matches.get_one::<usize>("batch-size") {
        config.batch_size = *batch_size;
    }
    if let Some(extra) = matches.get_many::<String>("require") {
        config.required_columns.extend(extra.cloned());
    }
    config.validate()?;
    logging::init(&config.logging)?;

    let path = matches.get_one::<PathBuf>("path").unwrap().clone();

    #[cfg(feature = "fast_local")]
    let expected_rows = if matches.get_flag("fast-local")
        && path.extension().and_then(|s| s.to_str()) == Some("csv")
    {
        let start = Instant::now();
        let count = product_ingest::count_rows_local(&path, b',')?;
        println!(
            "precount rows={} headers={:?} elapsed={:.2}s",
            count.data_rows,
            count.headers,
            start.elapsed().as_secs_f64()
        );
        Some(count.data_rows)
    } else {
        None
    };
    #[cfg(not(feature = "fast_local"))]
    let expected_rows: Option<u64> = {
        if matches.get_flag("fast-local") {
            eprintln!("--fast-local needs the fast_local feature; continuing without a row count");
        }
        None
    };

    let (events, mut event_rx) = EventTrigger::channel(config.event_queue_capacity);
    if matches.get_flag("events") {
        for event_type in EventType::ALL {
            events.subscribe(event_type);
        }
    }
    let delivered = tokio::spawn(async move {
        let mut count = 0u64;
        while event_rx.recv().await.is_some() {
            count += 1;
        }
        count
    });

    let store = Arc::new(MemoryStore::new());
    let importer = Importer::new(store.clone(), config, events.clone())?;

    let first = import_once(&importer, &path, expected_rows).await?;
    report(&path, &first.0, first.1);

    if matches.get_flag("verify") {
        let fingerprint = store.fingerprint().await;
        let second = import_once(&importer, &path, expected_rows).await?;
        report(&path, &second.0, second.1);
        let again = store.fingerprint().await;
        println!("fingerprint first=0x{fingerprint:08x} second=0x{again:08x}");
        if fingerprint != again {
            anyhow::bail!("store contents changed on re-import");
        }
    }

    println!("products stored={}", store.count().await?);
    drop(importer);
    drop(events);
    let delivered = delivered.await?;
    if matches.get_flag("events") {
        println!("events delivered={delivered}");
    }
    Ok(())
}

async fn import_once(
    importer: &Importer,
    path: &Path,
    expected_rows: Option<u64>,
) -> anyhow::Result<(Arc<JobSnapshot>, f64)> {
    let start = Instant::now();
    let mut source = ImportSource::from_path(path).await?;
    if let Some(rows) = expected_rows {
        source = source.with_expected_rows(rows);
    }
    let job_id = importer.start_import(source);
    let mut feed = importer
        .subscribe(&job_id)
        .ok_or_else(|| anyhow::anyhow!("job {job_id} vanished"))?;

    let mut last = feed.current();
    let mut shown = (last.state, u8::MAX);
    while let Some(snapshot) = feed.next().await {
        let key = (snapshot.state, snapshot.percent() / 10);
        if key != shown {
            eprintln!(
                "[{}] {:>3}% seen={} ok={} failed={}",
                snapshot.state,
                snapshot.percent(),
                snapshot.rows_seen,
                snapshot.rows_succeeded,
                snapshot.rows_failed
            );
            shown = key;
        }
        last = snapshot;
    }
    Ok((last, start.elapsed().as_secs_f64()))
}

fn report(path: &Path, job: &JobSnapshot, elapsed: f64) {
    let rps = (job.rows_seen as f64) / elapsed.max(f64::EPSILON);
    println!(
        "source={} job={} state={} rows={} ok={} created={} updated={} failed={}\nelapsed={:.1}s rows/sec={:.0}",
        path.display(),
        job.job_id,
        job.state,
        job.rows_seen,
        job.rows_succeeded,
        job.rows_created,
        job.rows_updated,
        job.rows_failed,
        elapsed,
        rps
    );
    if let Some(failure) = &job.failure {
        println!("failure: {failure}");
    }
    let summary = job.error_summary();
    if !summary.is_empty() {
        println!("{summary}");
    }
}
