use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use workpool::{PoolStats, UnitSnapshot};

use crate::server::state::ServerState;
use crate::server::ServerError;

pub async fn get_stats(
    State(server_state): State<Arc<ServerState>>,
) -> Result<Json<PoolStats>, ServerError> {
    Ok(Json(server_state.client.stats().await?))
}

pub async fn list_units(
    State(server_state): State<Arc<ServerState>>,
) -> Result<Json<Vec<UnitSnapshot>>, ServerError> {
    Ok(Json(server_state.client.unit_info().await?))
}
