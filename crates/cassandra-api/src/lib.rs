//! cassandra-api — REST API of the Cassandra scheduler.
//!
//! Read-only views of the configuration manager's cached record set. The
//! composite records are rendered with the same serializers used to
//! persist them, so a body decodes to exactly what the manager holds.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v1/config/servers` | Server count as a JSON integer |
//! | GET | `/v1/config/seeds` | Seed count as a JSON integer |
//! | GET | `/v1/config/cassandra` | Cassandra node configuration |
//! | GET | `/v1/config/executor` | Executor configuration |
//! | GET | `/v1/config/identity` | Framework identity, secret removed |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use cassandra_config::ConfigurationManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<ConfigurationManager>,
}

/// Build the complete API router.
pub fn build_router(manager: Arc<ConfigurationManager>) -> Router {
    let config_routes = Router::new()
        .route("/servers", get(handlers::get_servers))
        .route("/seeds", get(handlers::get_seeds))
        .route("/cassandra", get(handlers::get_cassandra_config))
        .route("/executor", get(handlers::get_executor_config))
        .route("/identity", get(handlers::get_identity))
        .with_state(ApiState { manager });

    Router::new().nest("/v1/config", config_routes)
}
