use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct CreateStateRequest {
    /// Height of the last block to include, or 0 for the current tip.
    pub max_height: u32,
}

#[derive(Serialize, Deserialize)]
pub struct LoadStateRequest {
    /// File name of the state inside the state directory.
    pub file: String,
}

#[derive(Serialize, Deserialize)]
pub struct StatusStringResponse {
    pub status: String,
}

#[derive(Serialize, Deserialize)]
pub struct ReadyToServeResponse {
    pub ready: bool,
}

#[derive(Serialize, Deserialize)]
pub struct StateSummary {
    pub height: u32,
    pub state_hash: String,
    pub confirmed: bool,
}

#[derive(Serialize, Deserialize)]
pub struct GetStatusResponse {
    pub tip_height: Option<u32>,
    pub header_best_known: u32,
    pub coin_count: u64,
    pub sync_complete: bool,
    pub full_sync_mode: bool,
    pub loading: bool,
    pub current: Option<StateSummary>,
    pub prev: Option<StateSummary>,
    pub downloaded: Option<StateSummary>,
}
