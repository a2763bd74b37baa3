//! Prometheus metrics for instrumented workflows
//!
//! # Available Metrics
//!
//! - `flowprobe_workflow_executions_total{workflow, status}` - Counter of finished executions
//! - `flowprobe_step_duration_seconds{workflow, step}` - Histogram of step durations
//! - `flowprobe_llm_calls_total{workflow, cache}` - Counter of LLM calls by cache outcome
//! - `flowprobe_db_operations_total{table, operation}` - Counter of database operations
//! - `flowprobe_scenario_results_total{status}` - Counter of scenario outcomes
//! - `flowprobe_active_executions` - Gauge of executions still running
//! - `flowprobe_cache_entries` - Gauge of responses held by the cache
//! - `flowprobe_snapshots` - Gauge of known database snapshots
//!
//! Counters are per process. The two state gauges are filled from disk at start-up, so a
//! fresh `flowprobe metrics` still reports the persisted cache and snapshot counts.
//!
//! # Example
//!
//! ```
//! use flowprobe::metrics::HarnessMetrics;
//!
//! let metrics = HarnessMetrics::new();
//! metrics.record_workflow_execution("campaign-analysis", "completed");
//! assert!(metrics.render().unwrap().contains("flowprobe_workflow_executions_total"));
//! ```

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket boundaries for step duration metrics (in seconds)
const STEP_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// Prometheus metric set shared by ledger, cache and scenario runner
#[derive(Clone)]
pub struct HarnessMetrics {
    registry: Arc<Registry>,
    workflow_executions: CounterVec,
    step_duration: HistogramVec,
    llm_calls: CounterVec,
    db_operations: CounterVec,
    scenario_results: CounterVec,
    active_executions: Gauge,
    cache_entries: Gauge,
    snapshots: Gauge,
}

impl HarnessMetrics {
    /// Create a metric set registered on a fresh registry
    pub fn new() -> Self {
        Self::try_new().expect("static metric definitions are valid")
    }

    fn try_new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let workflow_executions = CounterVec::new(
            Opts::new(
                "flowprobe_workflow_executions_total",
                "Total number of finished workflow executions",
            ),
            &["workflow", "status"],
        )?;

        let step_duration = HistogramVec::new(
            HistogramOpts::new(
                "flowprobe_step_duration_seconds",
                "Step duration in seconds",
            )
            .buckets(STEP_DURATION_BUCKETS.to_vec()),
            &["workflow", "step"],
        )?;

        let llm_calls = CounterVec::new(
            Opts::new("flowprobe_llm_calls_total", "Total number of LLM calls"),
            &["workflow", "cache"],
        )?;

        let db_operations = CounterVec::new(
            Opts::new(
                "flowprobe_db_operations_total",
                "Total number of database operations",
            ),
            &["table", "operation"],
        )?;

        let scenario_results = CounterVec::new(
            Opts::new(
                "flowprobe_scenario_results_total",
                "Total number of scenario runs by outcome",
            ),
            &["status"],
        )?;

        let active_executions = Gauge::with_opts(Opts::new(
            "flowprobe_active_executions",
            "Executions currently running",
        ))?;

        let cache_entries = Gauge::with_opts(Opts::new(
            "flowprobe_cache_entries",
            "Responses held by the response cache",
        ))?;

        let snapshots = Gauge::with_opts(Opts::new(
            "flowprobe_snapshots",
            "Known database snapshots",
        ))?;

        registry.register(Box::new(workflow_executions.clone()))?;
        registry.register(Box::new(step_duration.clone()))?;
        registry.register(Box::new(llm_calls.clone()))?;
        registry.register(Box::new(db_operations.clone()))?;
        registry.register(Box::new(scenario_results.clone()))?;
        registry.register(Box::new(active_executions.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(snapshots.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            workflow_executions,
            step_duration,
            llm_calls,
            db_operations,
            scenario_results,
            active_executions,
            cache_entries,
            snapshots,
        })
    }

    /// Record a finished workflow execution
    pub fn record_workflow_execution(&self, workflow: &str, status: &str) {
        self.workflow_executions
            .with_label_values(&[workflow, status])
            .inc();
    }

    /// Record a finished step
    pub fn record_step(&self, workflow: &str, step: &str, duration_ms: u64) {
        self.step_duration
            .with_label_values(&[workflow, step])
            .observe(duration_ms as f64 / 1000.0);
    }

    /// Record an LLM call and whether the cache served it
    pub fn record_llm_call(&self, workflow: &str, cache_hit: bool) {
        let outcome = if cache_hit { "hit" } else { "miss" };
        self.llm_calls.with_label_values(&[workflow, outcome]).inc();
    }

    /// Record a database operation
    pub fn record_db_operation(&self, table: &str, operation: &str) {
        self.db_operations
            .with_label_values(&[table, operation])
            .inc();
    }

    /// Record a scenario outcome ("passed" / "failed")
    pub fn record_scenario(&self, status: &str) {
        self.scenario_results.with_label_values(&[status]).inc();
    }

    pub fn inc_active_executions(&self) {
        self.active_executions.inc();
    }

    pub fn dec_active_executions(&self) {
        self.active_executions.dec();
    }

    /// Current value of the active executions gauge
    pub fn active_executions(&self) -> f64 {
        self.active_executions.get()
    }

    /// Publish the size of the cache and of the snapshot set
    pub fn set_state(&self, cache_entries: usize, snapshots: usize) {
        self.cache_entries.set(cache_entries as f64);
        self.snapshots.set(snapshots as f64);
    }

    /// Encode all metrics in Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve `/metrics` on 127.0.0.1:`port` in a background task
    pub async fn serve(&self, port: u16) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = metrics.handle_request(stream).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_request(&self, mut stream: tokio::net::TcpStream) -> anyhow::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        if request.starts_with("GET /metrics") {
            let body = self.render()?;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
            stream.write_all(response.as_bytes()).await?;
        }

        Ok(())
    }
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}
