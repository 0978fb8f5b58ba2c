use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SinkError, WriterError};
use crate::filter::AnnotationFilter;
use crate::pool::WriterPool;
use crate::template::PathTemplate;
use crate::types::{Payload, Record};
use crate::writer::{DEFAULT_TTL, ExpiryPolicy};

pub const DEFAULT_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Unit of work for the queue worker. All file mutations go through here.
#[derive(Debug)]
pub enum Job {
    WriteRecord { record: Record, tag: Arc<str> },
    CloseWriter(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub queue_size: usize,
    pub writer_ttl: Duration,
    pub gc_interval: Duration,
    pub expiry: ExpiryPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            writer_ttl: DEFAULT_TTL,
            gc_interval: DEFAULT_GC_INTERVAL,
            expiry: ExpiryPolicy::default(),
        }
    }
}

/// Outcome of one `add_payload` call, fed into the ingest counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    pub received: usize,
    pub accepted: usize,
}

struct Tasks {
    worker: JoinHandle<()>,
    collector: JoinHandle<()>,
}

/// Front door of the pipeline.
///
/// Producers enqueue jobs, a single worker task executes them in order and a
/// collector task periodically asks the worker to close idle writers.
pub struct Sink {
    pool: Arc<WriterPool>,
    filter: AnnotationFilter,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    gc_stop: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl Sink {
    /// Spawn the worker and the garbage collector. Must run inside a tokio runtime.
    pub fn start(config: SinkConfig, template: PathTemplate, filter: AnnotationFilter) -> Self {
        let pool = Arc::new(WriterPool::new(config.writer_ttl));
        let (tx, rx) = mpsc::channel::<Job>(config.queue_size);
        let gc_stop = CancellationToken::new();

        let worker = tokio::spawn(run_worker(rx, pool.clone(), template, config.expiry));
        let collector = tokio::spawn(run_collector(
            pool.clone(),
            tx.clone(),
            config.gc_interval,
            gc_stop.clone(),
        ));

        info!(
            "Sink started (queue size {}, writer ttl {:?}, gc interval {:?}, {:?} expiry)",
            config.queue_size, config.writer_ttl, config.gc_interval, config.expiry
        );

        Self {
            pool,
            filter,
            queue: Mutex::new(Some(tx)),
            gc_stop,
            tasks: Mutex::new(Some(Tasks { worker, collector })),
        }
    }

    /// Filter the payload and queue every accepted record for writing.
    ///
    /// Blocks while the queue is full. Records of one payload are queued in
    /// the order given.
    pub async fn add_payload(&self, payload: Payload) -> Result<Ingested, SinkError> {
        let queue = self.queue.lock().await.clone().ok_or(SinkError::Closed)?;

        let received = payload.records.len();
        let tag: Arc<str> = Arc::from(payload.tag);
        let mut accepted = 0;

        for record in payload.records {
            if !self.filter.include(&record) {
                continue;
            }

            queue
                .send(Job::WriteRecord {
                    record,
                    tag: tag.clone(),
                })
                .await
                .map_err(|_| SinkError::Closed)?;
            accepted += 1;
        }

        Ok(Ingested { received, accepted })
    }

    pub async fn open_writers(&self) -> usize {
        self.pool.count().await
    }

    pub fn opened_writers(&self) -> u64 {
        self.pool.opened_total()
    }

    /// Jobs waiting in the queue, not counting the one being executed. Reads
    /// zero once the sink is closed.
    pub async fn pending_jobs(&self) -> usize {
        self.queue
            .lock()
            .await
            .as_ref()
            .map_or(0, |queue| queue.max_capacity() - queue.capacity())
    }

    /// Stop the collector, close every writer and drain the queue.
    ///
    /// Every record queued before this call is written. Calling it again is a
    /// no-op.
    pub async fn close(&self) -> Result<(), SinkError> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };

        self.gc_stop.cancel();
        let collector = tasks.collector.await;
        debug!("Garbage collector stopped");

        let queue = self.queue.lock().await.take();
        if let Some(queue) = queue {
            for path in self.pool.snapshot_expired(None).await {
                if queue.send(Job::CloseWriter(path)).await.is_err() {
                    break;
                }
            }
        }

        // the worker exits once the last sender is gone and the queue is empty
        let worker = tasks.worker.await;
        info!("Job queue drained, all writers closed");

        collector.map_err(|source| SinkError::Join {
            task: "garbage collector",
            source,
        })?;
        worker.map_err(|source| SinkError::Join {
            task: "queue worker",
            source,
        })
    }
}

/// Sole consumer of the job queue.
pub(crate) async fn run_worker(
    mut jobs: mpsc::Receiver<Job>,
    pool: Arc<WriterPool>,
    template: PathTemplate,
    expiry: ExpiryPolicy,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::WriteRecord { record, tag } => {
                let path = template.resolve(&record, &tag);
                if let Err(err) = write_record(&pool, &path, &record, expiry).await {
                    warn!("Dropping record: {}", err);
                }
            }
            Job::CloseWriter(path) => {
                if let Err(err) = pool.remove_and_close(&path).await {
                    warn!("{}", err);
                }
            }
        }
    }

    // producers that raced the shutdown may have reopened files
    for path in pool.snapshot_expired(None).await {
        if let Err(err) = pool.remove_and_close(&path).await {
            warn!("{}", err);
        }
    }
}

async fn write_record(
    pool: &WriterPool,
    path: &Path,
    record: &Record,
    expiry: ExpiryPolicy,
) -> Result<(), WriterError> {
    let mut writer = pool.get_or_create(path).await?;
    writer.write(record).await?;

    if expiry == ExpiryPolicy::Sliding {
        writer.touch();
    }
    Ok(())
}

/// Periodically queue close jobs for expired writers until `stop` fires.
async fn run_collector(
    pool: Arc<WriterPool>,
    queue: mpsc::Sender<Job>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let expired = pool.snapshot_expired(Some(Instant::now())).await;
        if !expired.is_empty() {
            debug!("Closing {} expired writers", expired.len());
        }

        for path in expired {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                sent = queue.send(Job::CloseWriter(path)) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KubernetesMetadata;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    const PATTERN: &str = "%date%/%kubernetes_namespace_name%.json";

    fn record(namespace: &str, line: &str) -> Record {
        Record {
            date: Utc.with_ymd_and_hms(2023, 5, 1, 8, 30, 0).unwrap(),
            log: line.to_string(),
            kubernetes: KubernetesMetadata {
                namespace_name: namespace.to_string(),
                pod_name: "api-7f".to_string(),
                ..Default::default()
            },
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        let contents = std::fs::read_to_string(path).unwrap();
        contents
            .lines()
            .map(|line| {
                let record: Record = serde_json::from_str(line).unwrap();
                record.log
            })
            .collect()
    }

    fn start(root: &Path, config: SinkConfig) -> Sink {
        Sink::start(
            config,
            PathTemplate::new(root, PATTERN),
            AnnotationFilter::default(),
        )
    }

    #[tokio::test]
    async fn test_records_land_in_templated_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = start(dir.path(), SinkConfig::default());

        let payload = Payload::new(
            "",
            vec![
                record("checkout", "one"),
                record("billing", "two"),
                record("checkout", "three"),
            ],
        );
        let ingested = sink.add_payload(payload).await.unwrap();
        assert_eq!(
            ingested,
            Ingested {
                received: 3,
                accepted: 3
            }
        );

        sink.close().await.unwrap();

        assert_eq!(
            lines(&dir.path().join("2023-05-01/checkout.json")),
            vec!["one", "three"]
        );
        assert_eq!(lines(&dir.path().join("2023-05-01/billing.json")), vec!["two"]);
        assert_eq!(sink.open_writers().await, 0);
        assert_eq!(sink.opened_writers(), 2);
    }

    #[tokio::test]
    async fn test_ignored_records_are_counted_but_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let sink = start(dir.path(), SinkConfig::default());

        let mut ignored = record("secret", "hidden");
        ignored.kubernetes.annotations = BTreeMap::from([(
            "xrstf.de/bunker".to_string(),
            "ignore".to_string(),
        )]);

        let ingested = sink
            .add_payload(Payload::new("", vec![ignored, record("public", "shown")]))
            .await
            .unwrap();
        assert_eq!(
            ingested,
            Ingested {
                received: 2,
                accepted: 1
            }
        );

        sink.close().await.unwrap();
        assert!(!dir.path().join("2023-05-01/secret.json").exists());
        assert_eq!(lines(&dir.path().join("2023-05-01/public.json")), vec!["shown"]);
    }

    #[tokio::test]
    async fn test_add_payload_after_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = start(dir.path(), SinkConfig::default());

        sink.close().await.unwrap();
        sink.close().await.unwrap();

        let err = sink
            .add_payload(Payload::new("", vec![record("late", "x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Closed));
    }

    #[tokio::test]
    async fn test_worker_preserves_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let template = PathTemplate::new(dir.path(), PATTERN);
        let pool = Arc::new(WriterPool::new(DEFAULT_TTL));
        let (tx, rx) = mpsc::channel(16);

        let a = dir.path().join("2023-05-01/a.json");
        let tag: Arc<str> = Arc::from("");
        let write = |namespace: &str, line: &str| Job::WriteRecord {
            record: record(namespace, line),
            tag: tag.clone(),
        };

        for job in [
            write("a", "1"),
            write("a", "2"),
            Job::CloseWriter(a.clone()),
            write("a", "3"),
            Job::CloseWriter(a.clone()),
            Job::CloseWriter(a.clone()),
            write("a", "4"),
            write("b", "1"),
        ] {
            tx.send(job).await.unwrap();
        }
        drop(tx);

        run_worker(rx, pool.clone(), template, ExpiryPolicy::Sliding).await;

        assert_eq!(lines(&a), vec!["1", "2", "3", "4"]);
        // a was opened three times, b once
        assert_eq!(pool.opened_total(), 4);
        assert_eq!(pool.count().await, 0);
    }

    #[tokio::test]
    async fn test_worker_survives_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lost"), "not a directory").unwrap();

        let template = PathTemplate::new(dir.path(), "%kubernetes_namespace_name%/app.json");
        let pool = Arc::new(WriterPool::new(DEFAULT_TTL));
        let (tx, rx) = mpsc::channel(4);

        let tag: Arc<str> = Arc::from("");
        for namespace in ["lost", "kept"] {
            tx.send(Job::WriteRecord {
                record: record(namespace, namespace),
                tag: tag.clone(),
            })
            .await
            .unwrap();
        }
        drop(tx);

        run_worker(rx, pool.clone(), template, ExpiryPolicy::Sliding).await;

        assert_eq!(pool.opened_total(), 1);
        assert_eq!(lines(&dir.path().join("kept/app.json")), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_collector_closes_expired_writers() {
        let dir = tempfile::tempdir().unwrap();
        let sink = start(
            dir.path(),
            SinkConfig {
                writer_ttl: Duration::from_millis(30),
                gc_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        sink.add_payload(Payload::new("", vec![record("checkout", "one")]))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.open_writers().await != 0 || sink.opened_writers() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        sink.add_payload(Payload::new("", vec![record("checkout", "two")]))
            .await
            .unwrap();
        sink.close().await.unwrap();

        assert_eq!(sink.opened_writers(), 2);
        assert_eq!(
            lines(&dir.path().join("2023-05-01/checkout.json")),
            vec!["one", "two"]
        );
    }

    async fn keep_writing(sink: &Sink, rounds: usize) {
        for i in 0..rounds {
            sink.add_payload(Payload::new("", vec![record("busy", &i.to_string())]))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn expiring(expiry: ExpiryPolicy) -> SinkConfig {
        SinkConfig {
            writer_ttl: Duration::from_millis(200),
            gc_interval: Duration::from_millis(10),
            expiry,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sliding_expiry_keeps_busy_writer_open() {
        let dir = tempfile::tempdir().unwrap();
        let sink = start(dir.path(), expiring(ExpiryPolicy::Sliding));

        keep_writing(&sink, 30).await;
        assert_eq!(sink.opened_writers(), 1);
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_expiry_rotates_busy_writer() {
        let dir = tempfile::tempdir().unwrap();
        let sink = start(dir.path(), expiring(ExpiryPolicy::Fixed));

        keep_writing(&sink, 30).await;
        assert!(sink.opened_writers() >= 2);
        sink.close().await.unwrap();

        assert_eq!(lines(&dir.path().join("2023-05-01/busy.json")).len(), 30);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producers() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(start(
            dir.path(),
            SinkConfig {
                queue_size: 1,
                ..Default::default()
            },
        ));

        let stall = sink.pool.stall().await;

        let producer = {
            let sink = sink.clone();
            tokio::spawn(async move {
                let records = (0..3).map(|i| record("slow", &i.to_string())).collect();
                sink.add_payload(Payload::new("", records)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished());

        drop(stall);
        let ingested = producer.await.unwrap().unwrap();
        assert_eq!(ingested.accepted, 3);

        sink.close().await.unwrap();
        assert_eq!(
            lines(&dir.path().join("2023-05-01/slow.json")),
            vec!["0", "1", "2"]
        );
    }

    #[tokio::test]
    async fn test_pending_jobs_reports_queue_depth() {
        let dir = tempfile::tempdir().unwrap();
        let sink = start(
            dir.path(),
            SinkConfig {
                queue_size: 8,
                ..Default::default()
            },
        );

        let stall = sink.pool.stall().await;
        let records = (0..3).map(|i| record("queued", &i.to_string())).collect();
        sink.add_payload(Payload::new("", records)).await.unwrap();

        // the worker holds the first job while it waits for the pool
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.pending_jobs().await != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(stall);
        sink.close().await.unwrap();
        assert_eq!(lines(&dir.path().join("2023-05-01/queued.json")).len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_their_own_order() {
        const PRODUCERS: usize = 4;
        const RECORDS: usize = 50;

        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(start(
            dir.path(),
            SinkConfig {
                queue_size: 2,
                ..Default::default()
            },
        ));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    for chunk in 0..RECORDS / 5 {
                        let records = (0..5)
                            .map(|i| record("shared", &format!("{producer}:{}", chunk * 5 + i)))
                            .collect();
                        sink.add_payload(Payload::new("", records)).await.unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        sink.close().await.unwrap();

        let written = lines(&dir.path().join("2023-05-01/shared.json"));
        assert_eq!(written.len(), PRODUCERS * RECORDS);

        let mut next = [0usize; PRODUCERS];
        for line in written {
            let (producer, seq) = line.split_once(':').unwrap();
            let producer: usize = producer.parse().unwrap();
            assert_eq!(seq.parse::<usize>().unwrap(), next[producer]);
            next[producer] += 1;
        }
        assert_eq!(next, [RECORDS; PRODUCERS]);
    }
}
