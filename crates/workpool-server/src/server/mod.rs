pub mod data_models;
mod init;
pub mod routes;
mod state;
pub mod utils;

pub use init::{build_router, init_router, RouterArgs};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use workpool::TaskId;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Pool(#[from] workpool::Error),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Too many uncollected tasks: at most {0} may be parked")]
    TooManyParked(usize),

    #[error("Internal server error: `{0}`")]
    InternalError(#[from] anyhow::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        use workpool::Error;

        match self {
            ServerError::Pool(err) => match err {
                Error::QueueOverflow { .. } => StatusCode::TOO_MANY_REQUESTS,
                Error::UnknownKind(_) => StatusCode::BAD_REQUEST,
                Error::PoolShutdown | Error::Terminated => StatusCode::SERVICE_UNAVAILABLE,
                Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                Error::Cancelled => StatusCode::CONFLICT,
                Error::Handler(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::TooManyParked(_) => StatusCode::TOO_MANY_REQUESTS,
            ServerError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
