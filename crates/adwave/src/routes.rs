//! HTTP surface: health, reservation creation, and the WebSocket upgrade.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};

use crate::providers::Providers;
use crate::session::handle_socket;
use crate::slots::SlotPool;

/// Shared application state, one per server.
pub struct AppState {
    pub pool: Arc<SlotPool>,
    pub providers: Providers,
    pub reservation_ttl: Duration,
    pub acquire_timeout: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/clones/reservations/create", post(create_reservation))
        .route("/ws/ads/generate", get(ws_upgrade))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let available = state.pool.available_slots().await;
    Json(json!({
        "status": "ok",
        "slots": {
            "available": available,
            "total": state.pool.max_slots(),
        },
    }))
}

/// Issue a reservation ticket for a future custom-voice session.
///
/// 400 when capacity is exhausted, 500 when the grant was refused after the
/// capacity check (contention or store failure).
async fn create_reservation(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    if !state.pool.can_reserve().await {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"created": false, "detail": "No available slots"})),
        );
    }

    match state.pool.reserve(state.reservation_ttl).await {
        Some(ticket) => (
            StatusCode::CREATED,
            Json(json!({"reservation_id": ticket, "created": true})),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"created": false, "detail": "Failed to reserve slot"})),
        ),
    }
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testutil::{MockCollaborators, Scenario};
    use crate::slots::MemoryStore;

    fn app_state(max_slots: usize) -> Arc<AppState> {
        let mock = MockCollaborators::new(Scenario::default());
        Arc::new(AppState {
            pool: Arc::new(SlotPool::new(
                Arc::new(MemoryStore::new()),
                max_slots,
                Duration::from_secs(3600),
            )),
            providers: mock.providers(),
            reservation_ttl: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn health_reports_slot_counts() {
        let state = app_state(4);
        let Json(body) = health(State(state)).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["slots"]["available"], 4);
        assert_eq!(body["slots"]["total"], 4);
    }

    #[tokio::test]
    async fn reservation_created_until_capacity_runs_out() {
        let state = app_state(1);

        let (status, Json(body)) = create_reservation(State(Arc::clone(&state))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["created"], true);
        assert_eq!(body["reservation_id"].as_str().unwrap().len(), 8);

        // Capacity is gated by outstanding reservations too.
        let (status, Json(body)) = create_reservation(State(state)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["created"], false);
        assert_eq!(body["detail"], "No available slots");
    }
}
