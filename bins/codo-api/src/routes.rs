use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/problems/:id/submit", post(handlers::submit))
        .route("/my-submissions", get(handlers::my_submissions))
        .route(
            "/submissions/:id",
            get(handlers::get_submission).delete(handlers::cancel_submission),
        )
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
