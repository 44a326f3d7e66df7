// Prometheus metrics for the HTTP boundary
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    /// Submissions by outcome: queued, refused (queue full), rejected (bad request)
    pub static ref SUBMISSIONS: IntCounterVec = register_int_counter_vec!(
        "codo_api_submissions_total",
        "Submission requests by outcome",
        &["outcome"]
    )
    .expect("submission counter registers once");
    pub static ref CANCELLATIONS: IntCounterVec = register_int_counter_vec!(
        "codo_api_cancellations_total",
        "Cancellation requests by outcome",
        &["outcome"]
    )
    .expect("cancellation counter registers once");
}

pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
