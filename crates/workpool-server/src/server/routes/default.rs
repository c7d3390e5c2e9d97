use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::server::data_models::KindsResponse;
use crate::server::state::ServerState;
use crate::server::ServerError;

/// Reports healthy as long as the pool still answers.
pub async fn health_check(
    State(server_state): State<Arc<ServerState>>,
) -> Result<Json<KindsResponse>, ServerError> {
    server_state.client.stats().await?;

    Ok(Json(KindsResponse {
        status: "ok".to_string(),
        kinds: server_state
            .client
            .kinds()
            .into_iter()
            .map(str::to_owned)
            .collect(),
    }))
}
