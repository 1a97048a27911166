//! Statistics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;

/// Latency samples kept per window
const SAMPLE_WINDOW: usize = 1000;

/// Point-in-time snapshot of a pool
///
/// # Examples
///
/// ```
/// use esox_connectionpool::PoolStatistics;
///
/// let stats = PoolStatistics::default();
/// let exported = stats.export();
/// assert_eq!(exported["total_acquired"], "0");
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStatistics {
    /// Connections tracked by the pool, in any state
    pub total_connections: usize,

    /// Connections waiting in the idle set
    pub idle_connections: usize,

    /// Connections currently checked out
    pub acquired_connections: usize,

    /// Callers waiting in the acquire queue
    pub pending_requests: usize,

    pub total_acquired: u64,
    pub total_released: u64,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_errors: u64,
    pub total_timeouts: u64,

    /// Mean time from `acquire` to hand-out over the last 1000 acquisitions
    pub average_acquire_time: Duration,

    /// Mean time a connection stayed checked out over the last 1000 releases
    pub average_use_time: Duration,

    pub uptime: Duration,

    /// Acquired connections relative to `max_connections` (0.0 to 1.0)
    pub utilization: f64,

    pub max_connections: usize,
}

impl PoolStatistics {
    /// Export statistics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_connections".to_string(), self.total_connections.to_string());
        metrics.insert("idle_connections".to_string(), self.idle_connections.to_string());
        metrics.insert("acquired_connections".to_string(), self.acquired_connections.to_string());
        metrics.insert("pending_requests".to_string(), self.pending_requests.to_string());
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("total_errors".to_string(), self.total_errors.to_string());
        metrics.insert("total_timeouts".to_string(), self.total_timeouts.to_string());
        metrics.insert(
            "average_acquire_ms".to_string(),
            format!("{:.3}", self.average_acquire_time.as_secs_f64() * 1000.0),
        );
        metrics.insert(
            "average_use_ms".to_string(),
            format!("{:.3}", self.average_use_time.as_secs_f64() * 1000.0),
        );
        metrics.insert("uptime_seconds".to_string(), self.uptime.as_secs().to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("max_connections".to_string(), self.max_connections.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Render statistics in the Prometheus text exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::{MetricsExporter, PoolStatistics};
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&PoolStatistics::default(), "primary", Some(&tags)).unwrap();
    /// assert!(output.contains("connectionpool_connections_idle"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        stats: &PoolStatistics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let mut labels = HashMap::new();
        labels.insert("pool".to_string(), pool_name.to_string());
        if let Some(tags) = tags {
            labels.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(labels.clone());

        let registry = Registry::new();

        let gauges = [
            ("connectionpool_connections_total", "Tracked connections", stats.total_connections),
            ("connectionpool_connections_idle", "Idle connections", stats.idle_connections),
            ("connectionpool_connections_acquired", "Acquired connections", stats.acquired_connections),
            ("connectionpool_requests_pending", "Queued acquire requests", stats.pending_requests),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help))?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge))?;
        }

        let counters = [
            ("connectionpool_acquired_total", "Connections handed out", stats.total_acquired),
            ("connectionpool_released_total", "Connections returned", stats.total_released),
            ("connectionpool_created_total", "Connections created", stats.total_created),
            ("connectionpool_destroyed_total", "Connections destroyed", stats.total_destroyed),
            ("connectionpool_errors_total", "Factory and validation errors", stats.total_errors),
            ("connectionpool_timeouts_total", "Acquire timeouts", stats.total_timeouts),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help))?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let utilization = Gauge::with_opts(opts("connectionpool_utilization", "Pool utilization ratio"))?;
        utilization.set(stats.utilization);
        registry.register(Box::new(utilization))?;

        let acquire = Gauge::with_opts(opts(
            "connectionpool_acquire_seconds_avg",
            "Mean acquire latency",
        ))?;
        acquire.set(stats.average_acquire_time.as_secs_f64());
        registry.register(Box::new(acquire))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Rolling mean over the most recent samples, lock-free
struct LatencyWindow {
    samples: ArrayQueue<u64>,
    total_micros: AtomicU64,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: ArrayQueue::new(SAMPLE_WINDOW),
            total_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, sample: Duration) {
        let micros = sample.as_micros().min(u64::MAX as u128) as u64;
        // Add before pushing so an evicted sample is always already counted
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        if let Some(evicted) = self.samples.force_push(micros) {
            self.total_micros.fetch_sub(evicted, Ordering::Relaxed);
        }
    }

    fn average(&self) -> Duration {
        let count = self.samples.len() as u64;
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed) / count)
    }
}

/// Internal statistics tracker
pub(crate) struct StatisticsTracker {
    pub total_acquired: AtomicU64,
    pub total_released: AtomicU64,
    pub total_created: AtomicU64,
    pub total_destroyed: AtomicU64,
    pub total_errors: AtomicU64,
    pub total_timeouts: AtomicU64,
    acquire_times: LatencyWindow,
    use_times: LatencyWindow,
    sampling: bool,
}

impl StatisticsTracker {
    pub fn new(sampling: bool) -> Self {
        Self {
            total_acquired: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
            total_destroyed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            acquire_times: LatencyWindow::new(),
            use_times: LatencyWindow::new(),
            sampling,
        }
    }

    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire(&self, waited: Duration) {
        Self::increment(&self.total_acquired);
        if self.sampling {
            self.acquire_times.record(waited);
        }
    }

    pub fn record_release(&self, used: Duration) {
        Self::increment(&self.total_released);
        if self.sampling {
            self.use_times.record(used);
        }
    }

    /// Fill in the cumulative part of a snapshot
    pub fn fill(&self, stats: &mut PoolStatistics) {
        stats.total_acquired = self.total_acquired.load(Ordering::Relaxed);
        stats.total_released = self.total_released.load(Ordering::Relaxed);
        stats.total_created = self.total_created.load(Ordering::Relaxed);
        stats.total_destroyed = self.total_destroyed.load(Ordering::Relaxed);
        stats.total_errors = self.total_errors.load(Ordering::Relaxed);
        stats.total_timeouts = self.total_timeouts.load(Ordering::Relaxed);
        stats.average_acquire_time = self.acquire_times.average();
        stats.average_use_time = self.use_times.average();
    }
}
