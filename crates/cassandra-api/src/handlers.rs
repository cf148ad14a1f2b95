//! REST API handlers.
//!
//! Each handler reads the manager's cached snapshot; none touches the store.

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use cassandra_config::ConfigError;
use cassandra_core::{CassandraConfig, ExecutorConfig, Identity, Serializer};
use tracing::warn;

use crate::ApiState;

/// Error body, matching the `success`/`error` shape of the other responses.
#[derive(serde::Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: msg.to_string(),
        }),
    )
        .into_response()
}

/// A manager that is starting, stopped, failed or cut off from the store
/// cannot vouch for its configuration.
fn config_error(err: &ConfigError) -> Response {
    let status = match err {
        ConfigError::NotReady { .. } | ConfigError::Failed(_) | ConfigError::Store(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, %status, "configuration unavailable");
    error_response(&err.to_string(), status)
}

fn record_response<T, S: Serializer<T>>(serializer: &S, value: &T) -> Response {
    match serializer.serialize(value) {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /v1/config/servers
pub async fn get_servers(State(state): State<ApiState>) -> Response {
    match state.manager.servers() {
        Ok(servers) => Json(servers).into_response(),
        Err(e) => config_error(&e),
    }
}

/// GET /v1/config/seeds
pub async fn get_seeds(State(state): State<ApiState>) -> Response {
    match state.manager.seeds() {
        Ok(seeds) => Json(seeds).into_response(),
        Err(e) => config_error(&e),
    }
}

/// GET /v1/config/cassandra
pub async fn get_cassandra_config(State(state): State<ApiState>) -> Response {
    match state.manager.cassandra_config() {
        Ok(config) => record_response(&CassandraConfig::JSON_SERIALIZER, &config),
        Err(e) => config_error(&e),
    }
}

/// GET /v1/config/executor
pub async fn get_executor_config(State(state): State<ApiState>) -> Response {
    match state.manager.executor_config() {
        Ok(config) => record_response(&ExecutorConfig::JSON_SERIALIZER, &config),
        Err(e) => config_error(&e),
    }
}

/// GET /v1/config/identity
pub async fn get_identity(State(state): State<ApiState>) -> Response {
    match state.manager.identity() {
        Ok(identity) => {
            let public = Identity {
                secret: None,
                ..identity
            };
            record_response(&Identity::JSON_SERIALIZER, &public)
        }
        Err(e) => config_error(&e),
    }
}
