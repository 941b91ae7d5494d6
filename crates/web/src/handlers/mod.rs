use axum::{Router, routing::post};

use crate::AppState;

mod receive;

/// A single endpoint. Deliveries and administrator commands are told apart by
/// their shape; other methods get 405 from the router.
pub fn build_router() -> Router<AppState> { Router::new().route("/", post(receive::receive)) }
