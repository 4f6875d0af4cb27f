use super::types::*;
use crate::chainstate::ChainStateStore;
use crate::node::NodeHandle;
use crate::snapshot::StateHandle;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

type AppState = NodeHandle;

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

pub async fn health() -> &'static str {
    "OK"
}

fn summarize(state: &StateHandle) -> StateSummary {
    StateSummary {
        height: state.height(),
        state_hash: state.state_hash().to_string(),
        confirmed: state.is_confirmed(),
    }
}

pub async fn get_status(State(node): State<AppState>) -> Json<GetStatusResponse> {
    let rt = node.runtime.lock().await;
    Json(GetStatusResponse {
        tip_height: rt.chainstate.chain.tip_height(),
        header_best_known: rt.header_best_known,
        coin_count: rt.chainstate.coins.coin_count().unwrap_or(0),
        sync_complete: rt.sync_complete,
        full_sync_mode: rt.full_sync_mode,
        loading: rt.loading,
        current: rt.current.as_deref().map(summarize),
        prev: rt.prev.as_deref().map(summarize),
        downloaded: rt.downloaded.as_deref().map(summarize),
    })
}

/// Schedule writing a state file for the given height (0 = current tip).
pub async fn create_state(
    State(node): State<AppState>,
    Json(req): Json<CreateStateRequest>,
) -> Result<Json<StatusStringResponse>, ErrorResponse> {
    let status = node
        .create_state(req.max_height)
        .await
        .map_err(|e| ErrorResponse {
            error: e.to_string(),
        })?;
    Ok(Json(StatusStringResponse { status }))
}

/// Load the named state file and apply it to the UTXO database.
pub async fn load_state(
    State(node): State<AppState>,
    Json(req): Json<LoadStateRequest>,
) -> Result<Json<StatusStringResponse>, ErrorResponse> {
    let status = node
        .load_state(&req.file)
        .await
        .map_err(|e| ErrorResponse {
            error: e.to_string(),
        })?;
    Ok(Json(StatusStringResponse { status }))
}

pub async fn ready_to_serve(State(node): State<AppState>) -> Json<ReadyToServeResponse> {
    Json(ReadyToServeResponse {
        ready: node.ready_to_serve().await,
    })
}
