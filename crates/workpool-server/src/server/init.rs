use axum::extract::MatchedPath;
use axum::http::Request;
use axum::routing::{get, post};
use axum::Router;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info_span, Span};
use workpool::{Client, PoolConfig};

use crate::server::routes::{default, pool, tasks};
use crate::server::state::{ParkingLimits, ServerState};

/// Slack on top of the task timeout before the HTTP layer gives up.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_PARKED_TASKS: usize = 10_000;
pub const DEFAULT_RESULT_TTL_SECS: u64 = 300;

#[derive(Debug, Args)]
pub struct RouterArgs {
    #[clap(flatten)]
    pub pool: PoolConfig,

    /// Tasks submitted with `POST /v1/tasks` whose results may wait for
    /// collection at once
    #[arg(long, default_value_t = DEFAULT_MAX_PARKED_TASKS)]
    pub max_parked_tasks: usize,

    /// Seconds an uncollected result is kept
    #[arg(long, default_value_t = DEFAULT_RESULT_TTL_SECS)]
    pub result_ttl_secs: u64,
}

impl RouterArgs {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            pool,
            max_parked_tasks: DEFAULT_MAX_PARKED_TASKS,
            result_ttl_secs: DEFAULT_RESULT_TTL_SECS,
        }
    }

    fn parking_limits(&self) -> ParkingLimits {
        ParkingLimits {
            max_parked: self.max_parked_tasks,
            result_ttl: Duration::from_secs(self.result_ttl_secs),
        }
    }
}

/// Start a pool with the built-in handlers and wire the HTTP routes to it.
/// The returned client is the one to shut down once the server stops.
pub fn init_router(args: &RouterArgs) -> anyhow::Result<(Router, Client)> {
    let client = Client::builder()
        .with_config(args.pool.clone())
        .with_builtin_handlers()
        .build()?;

    Ok((build_router(client.clone(), args), client))
}

/// Routes over an already running pool.
pub fn build_router(client: Client, args: &RouterArgs) -> Router {
    let state = Arc::new(ServerState::new(client, args.parking_limits()));
    state.start_reaper();

    Router::new()
        .route("/v1/tasks", post(tasks::submit_task))
        .route("/v1/tasks/execute", post(tasks::execute_task))
        .route(
            "/v1/tasks/:task_id",
            get(tasks::get_task_result).delete(tasks::cancel_task),
        )
        .route("/v1/stats", get(pool::get_stats))
        .route("/v1/units", get(pool::list_units))
        .route("/health", get(default::health_check))
        .with_state(state)
        .layer((
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    // Log the matched route's path (with placeholders not filled in).
                    let matched_path = request
                        .extensions()
                        .get::<MatchedPath>()
                        .map(MatchedPath::as_str);
                    tracing::debug!("{}", request.uri());

                    info_span!(
                        "http_request",
                        method = ?request.method(),
                        matched_path,
                        task_id = tracing::field::Empty,
                    )
                })
                .on_request(|_request: &Request<_>, _span: &Span| {}),
            TimeoutLayer::new(args.pool.task_timeout() + REQUEST_TIMEOUT_SLACK),
        ))
}
