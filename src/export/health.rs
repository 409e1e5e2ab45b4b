use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "schedscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total sample cycles committed to the ring.
    pub samples_written: Counter,
    /// Total cycles that overran the sampling interval.
    pub cycle_overruns: Counter,
    /// Total per-PID taskstats observations missing (non-fatal errors).
    pub taskstats_errors: Counter,
    /// Total identity-cache entries removed by pruning.
    pub identities_pruned: Counter,
    /// Total queries served, by method.
    pub queries_total: CounterVec,
    /// Processes captured in the most recent cycle.
    pub pids_sampled: Gauge,
    /// Current identity-cache size.
    pub identity_cache_size: Gauge,
    /// Entries currently held in the ring.
    pub ring_entries: Gauge,
    /// Sample cycle duration (1ms-500ms buckets).
    pub cycle_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_written = Counter::with_opts(
            Opts::new(
                "samples_written_total",
                "Total sample cycles committed to the ring.",
            )
            .namespace("schedscope"),
        )?;
        let cycle_overruns = Counter::with_opts(
            Opts::new(
                "cycle_overruns_total",
                "Total cycles that exceeded the sampling interval.",
            )
            .namespace("schedscope"),
        )?;
        let taskstats_errors = Counter::with_opts(
            Opts::new(
                "taskstats_errors_total",
                "Total per-PID taskstats observations missing.",
            )
            .namespace("schedscope"),
        )?;
        let identities_pruned = Counter::with_opts(
            Opts::new(
                "identities_pruned_total",
                "Total identity-cache entries removed by pruning.",
            )
            .namespace("schedscope"),
        )?;
        let queries_total = CounterVec::new(
            Opts::new("queries_total", "Total queries served by method.")
                .namespace("schedscope"),
            &["method"],
        )?;
        let pids_sampled = Gauge::with_opts(
            Opts::new(
                "pids_sampled",
                "Processes captured in the most recent cycle.",
            )
            .namespace("schedscope"),
        )?;
        let identity_cache_size = Gauge::with_opts(
            Opts::new("identity_cache_size", "Current identity-cache size.")
                .namespace("schedscope"),
        )?;
        let ring_entries = Gauge::with_opts(
            Opts::new("ring_entries", "Entries currently held in the ring.")
                .namespace("schedscope"),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("cycle_duration_seconds", "Sample cycle duration.")
                .namespace("schedscope")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.2, 0.5]),
        )?;

        registry.register(Box::new(samples_written.clone()))?;
        registry.register(Box::new(cycle_overruns.clone()))?;
        registry.register(Box::new(taskstats_errors.clone()))?;
        registry.register(Box::new(identities_pruned.clone()))?;
        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(pids_sampled.clone()))?;
        registry.register(Box::new(identity_cache_size.clone()))?;
        registry.register(Box::new(ring_entries.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_written,
            cycle_overruns,
            taskstats_errors,
            identities_pruned,
            queries_total,
            pids_sampled,
            identity_cache_size,
            ring_entries,
            cycle_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.samples_written.inc();
        health.pids_sampled.set(42.0);
        health.queries_total.with_label_values(&["readSamples"]).inc();

        let families = health.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "schedscope_samples_written_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "schedscope_queries_total"));
    }

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
