// Prometheus metrics for the worker, served next to a liveness probe.
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::info;

lazy_static! {
    pub static ref VERDICTS: IntCounterVec = register_int_counter_vec!(
        "codo_worker_verdicts_total",
        "Terminal verdicts written by this worker",
        &["status", "language"]
    )
    .expect("verdict counter registers once");
    pub static ref JUDGE_SECONDS: HistogramVec = register_histogram_vec!(
        "codo_worker_judge_duration_seconds",
        "Wall time spent judging one submission",
        &["language"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("judge histogram registers once");
    pub static ref RETRIES: IntCounter = register_int_counter!(
        "codo_worker_retries_total",
        "Attempts requeued after a crash or sandbox fault"
    )
    .expect("retry counter registers once");
    pub static ref INFRA_FAILURES: IntCounter = register_int_counter!(
        "codo_worker_infrastructure_failures_total",
        "Submissions failed after exhausting their attempts"
    )
    .expect("failure counter registers once");
    pub static ref ABANDONED_RUNS: IntCounter = register_int_counter!(
        "codo_worker_abandoned_runs_total",
        "Runs stopped because their lease could not be renewed"
    )
    .expect("abandoned counter registers once");
    pub static ref BUSY_WORKERS: IntGauge = register_int_gauge!(
        "codo_worker_busy",
        "Workers currently judging"
    )
    .expect("busy gauge registers once");
}

/// Render every registered metric in the text exposition format
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(|| async { render() }))
        .route("/health", get(|| async { "ok" }))
}

pub async fn serve(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;
    info!("Metrics listening on {}", addr);
    axum::serve(listener, router())
        .await
        .context("Metrics server error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        VERDICTS.with_label_values(&["accepted", "python"]).inc();
        RETRIES.inc();
        let text = render();
        assert!(text.contains("codo_worker_verdicts_total"));
        assert!(text.contains("codo_worker_retries_total"));
    }
}
