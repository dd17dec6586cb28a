//! Prometheus metrics for the orchestration layer
//!
//! Every component mirrors its counters here so a host process can expose
//! them in Prometheus text format.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for reqflow metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Cache Metrics ==============

    /// Cache hits counter with cache label (api, memory, optimizer, count)
    pub static ref CACHE_HITS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_hits_total", "Total cache hits")
            .namespace("reqflow"),
        &["cache"]
    ).expect("metric can be created");

    /// Cache misses counter with cache label
    pub static ref CACHE_MISSES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_misses_total", "Total cache misses")
            .namespace("reqflow"),
        &["cache"]
    ).expect("metric can be created");

    /// Entries evicted to stay within capacity or byte budget
    pub static ref CACHE_EVICTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_evictions_total", "Total cache evictions")
            .namespace("reqflow"),
        &["cache"]
    ).expect("metric can be created");

    /// Cache size gauge (number of entries)
    pub static ref CACHE_SIZE: GaugeVec = GaugeVec::new(
        Opts::new("cache_size", "Current cache size (entries)")
            .namespace("reqflow"),
        &["cache"]
    ).expect("metric can be created");

    /// Estimated bytes held by the memory bounder
    pub static ref MEMORY_BYTES: Gauge = Gauge::with_opts(
        Opts::new("memory_bytes", "Estimated bytes held by the memory bounder")
            .namespace("reqflow")
    ).expect("metric can be created");

    // ============== Admission Metrics ==============

    /// Admission decisions per category (admitted, queued, denied)
    pub static ref ADMISSIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("admissions_total", "Rate limiter admission decisions")
            .namespace("reqflow"),
        &["category", "outcome"]
    ).expect("metric can be created");

    /// Actions waiting for a rate window to reopen
    pub static ref LIMITER_QUEUE_SIZE: GaugeVec = GaugeVec::new(
        Opts::new("limiter_queue_size", "Actions waiting for admission")
            .namespace("reqflow"),
        &["category"]
    ).expect("metric can be created");

    // ============== Scheduler Metrics ==============

    /// Current queue size gauge per priority tier
    pub static ref QUEUE_SIZE: GaugeVec = GaugeVec::new(
        Opts::new("queue_size", "Current number of requests in queue")
            .namespace("reqflow"),
        &["priority"]
    ).expect("metric can be created");

    /// Queue wait time histogram
    pub static ref QUEUE_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "queue_wait_seconds",
            "Time spent waiting in queue"
        )
        .namespace("reqflow")
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0])
    ).expect("metric can be created");

    /// Active requests gauge (currently executing)
    pub static ref ACTIVE_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("active_requests", "Number of requests currently executing")
            .namespace("reqflow")
    ).expect("metric can be created");

    /// Terminal outcomes of scheduled requests (processed, failed, dropped, rejected)
    pub static ref SCHEDULED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("scheduled_total", "Scheduled request outcomes")
            .namespace("reqflow"),
        &["outcome"]
    ).expect("metric can be created");

    // ============== Pool Metrics ==============

    /// Open realtime channels
    pub static ref POOL_CHANNELS: Gauge = Gauge::with_opts(
        Opts::new("pool_channels", "Open realtime channels")
            .namespace("reqflow")
    ).expect("metric can be created");

    // ============== Query Metrics ==============

    /// Batches dispatched to the backend, by dispatch mode
    pub static ref BATCHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("batches_total", "Batches dispatched to the backend")
            .namespace("reqflow"),
        &["mode"]
    ).expect("metric can be created");

    /// Queries by table and status
    pub static ref QUERIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("queries_total", "Total optimizer queries")
            .namespace("reqflow"),
        &["table", "status"]
    ).expect("metric can be created");

    /// Query duration histogram by table
    pub static ref QUERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "query_duration_seconds",
            "Query duration in seconds"
        )
        .namespace("reqflow")
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["table"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    // Cache metrics
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_EVICTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_SIZE.clone()))?;
    REGISTRY.register(Box::new(MEMORY_BYTES.clone()))?;

    // Admission metrics
    REGISTRY.register(Box::new(ADMISSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LIMITER_QUEUE_SIZE.clone()))?;

    // Scheduler metrics
    REGISTRY.register(Box::new(QUEUE_SIZE.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(SCHEDULED_TOTAL.clone()))?;

    // Pool metrics
    REGISTRY.register(Box::new(POOL_CHANNELS.clone()))?;

    // Query metrics
    REGISTRY.register(Box::new(BATCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUERY_DURATION_SECONDS.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Helper struct for tracking query duration.
/// Records the query as an error if dropped without an explicit outcome.
pub struct QueryTimer {
    table: String,
    start: std::time::Instant,
}

impl QueryTimer {
    /// Start a new query timer for the given table.
    pub fn new(table: &str) -> Self {
        Self { table: table.to_string(), start: std::time::Instant::now() }
    }

    /// Record a successful query.
    pub fn record_success(self) {
        self.finish("ok");
    }

    /// Record a failed query.
    pub fn record_failure(self) {
        self.finish("error");
    }

    fn finish(self, status: &str) {
        QUERY_DURATION_SECONDS
            .with_label_values(&[&self.table])
            .observe(self.start.elapsed().as_secs_f64());
        QUERIES_TOTAL.with_label_values(&[&self.table, status]).inc();
        // Prevent the Drop impl from running
        std::mem::forget(self);
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        // The caller stopped waiting before the query settled
        QUERIES_TOTAL.with_label_values(&[&self.table, "abandoned"]).inc();
    }
}

/// Record a cache hit.
pub fn record_cache_hit(cache: &str) {
    CACHE_HITS_TOTAL.with_label_values(&[cache]).inc();
}

/// Record a cache miss.
pub fn record_cache_miss(cache: &str) {
    CACHE_MISSES_TOTAL.with_label_values(&[cache]).inc();
}

/// Record evicted entries.
pub fn record_cache_evictions(cache: &str, count: u64) {
    CACHE_EVICTIONS_TOTAL.with_label_values(&[cache]).inc_by(count as f64);
}

/// Update cache size gauge.
pub fn set_cache_size(cache: &str, size: u64) {
    CACHE_SIZE.with_label_values(&[cache]).set(size as f64);
}

/// Update the memory bounder byte gauge.
pub fn set_memory_bytes(bytes: u64) {
    MEMORY_BYTES.set(bytes as f64);
}

/// Record a rate limiter decision.
pub fn record_admission(category: &str, outcome: &str) {
    ADMISSIONS_TOTAL.with_label_values(&[category, outcome]).inc();
}

/// Update the number of actions waiting on a category.
pub fn set_limiter_queue_size(category: &str, size: u64) {
    LIMITER_QUEUE_SIZE.with_label_values(&[category]).set(size as f64);
}

/// Update queue size gauge for a tier.
pub fn set_queue_size(priority: &str, size: u64) {
    QUEUE_SIZE.with_label_values(&[priority]).set(size as f64);
}

/// Record queue wait time.
pub fn record_queue_wait(wait_secs: f64) {
    QUEUE_WAIT_SECONDS.observe(wait_secs);
}

/// Update the executing request gauge.
pub fn set_active_requests(active: u64) {
    ACTIVE_REQUESTS.set(active as f64);
}

/// Record a terminal scheduler outcome.
pub fn record_scheduled(outcome: &str) {
    SCHEDULED_TOTAL.with_label_values(&[outcome]).inc();
}

/// Update the open channel gauge.
pub fn set_pool_channels(channels: u64) {
    POOL_CHANNELS.set(channels as f64);
}

/// Record a dispatched batch.
pub fn record_batch(mode: &str) {
    BATCHES_TOTAL.with_label_values(&[mode]).inc();
}
