use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::sink::Ingested;

// counters get their `_total` suffix from the client library
const REQUESTS_TOTAL: &str = "bunker_requests";
const RECEIVED_RECORDS_TOTAL: &str = "bunker_received_records";
const INGESTED_RECORDS_TOTAL: &str = "bunker_ingested_records";
const OPEN_WRITERS: &str = "bunker_open_writers";
const QUEUED_JOBS: &str = "bunker_queued_jobs";

const STATUS_LABEL: &str = "status";

/// Metrics exposed on `/metrics`. Built once in `main` and handed to the
/// server, nothing here is global.
pub struct Metrics {
    registry: Registry,
    requests: Family<Vec<(String, String)>, Counter>,
    records_received: Counter,
    records_ingested: Counter,
    open_writers: Gauge,
    queued_jobs: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let requests = Family::<Vec<(String, String)>, Counter>::default();
        let records_received = Counter::default();
        let records_ingested = Counter::default();
        let open_writers = Gauge::default();
        let queued_jobs = Gauge::default();

        registry.register(
            REQUESTS_TOTAL,
            "The total number of handled requests",
            requests.clone(),
        );
        registry.register(
            RECEIVED_RECORDS_TOTAL,
            "The total number of received records",
            records_received.clone(),
        );
        registry.register(
            INGESTED_RECORDS_TOTAL,
            "The total number of ingested records",
            records_ingested.clone(),
        );
        registry.register(
            OPEN_WRITERS,
            "The number of currently open file writers",
            open_writers.clone(),
        );
        registry.register(
            QUEUED_JOBS,
            "The number of jobs waiting for the writer queue",
            queued_jobs.clone(),
        );

        Self {
            registry,
            requests,
            records_received,
            records_ingested,
            open_writers,
            queued_jobs,
        }
    }

    pub fn record_request(&self, status: u16) {
        self.requests
            .get_or_create(&vec![(STATUS_LABEL.to_string(), status.to_string())])
            .inc();
    }

    pub fn record_ingest(&self, ingested: Ingested) {
        self.records_received.inc_by(ingested.received as u64);
        self.records_ingested.inc_by(ingested.accepted as u64);
    }

    /// Refresh the gauges that are sampled from the sink at scrape time.
    pub fn set_pipeline_state(&self, open_writers: usize, queued_jobs: usize) {
        self.open_writers
            .set(i64::try_from(open_writers).unwrap_or(i64::MAX));
        self.queued_jobs
            .set(i64::try_from(queued_jobs).unwrap_or(i64::MAX));
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
