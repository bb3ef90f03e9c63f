//! Gateway lifecycle and the HTTP status endpoint.

use crate::config::Config;
use crate::{metrics, plugins};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use gateway_protocol::{Operation, Reason, Request, Sequence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tenvis_gateway_core::{CommunicationManager, MemoryCache, ReplyCache};
use tenvis_gateway_plugin::{LinkError, MemoryOrigin};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How long a submitted request waits for its reply.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// The routing hub.
    pub manager: CommunicationManager,
    /// Server configuration.
    pub config: Config,
    /// Origin plugins by protocol name.
    pub origins: BTreeMap<String, Arc<MemoryOrigin>>,
}

impl AppState {
    /// Build the manager and register every configured plugin.
    ///
    /// # Errors
    ///
    /// Returns an error if a plugin cannot be built or registered.
    pub fn new(config: Config) -> Result<Self> {
        let manager_config = config.dispatch.manager_config();
        let manager = if config.cache.enabled {
            let cache: Arc<dyn ReplyCache> = Arc::new(MemoryCache::new(
                Duration::from_millis(config.cache.default_ttl_ms),
                config.cache.max_entries,
            ));
            CommunicationManager::with_cache(manager_config, cache)
        } else {
            CommunicationManager::new(manager_config)
        };

        let mut origins = BTreeMap::new();
        for (name, plugin_config) in &config.plugins {
            let built = plugins::build(name, plugin_config)?;
            let plugin = built.plugin();
            let protocol = plugin.protocol().to_string();
            manager
                .register(plugin)
                .with_context(|| format!("Failed to register plugin {name}"))?;
            if let Some(origin) = built.origin() {
                origins.insert(protocol, origin.clone());
            }
        }
        if config.plugins.is_empty() {
            warn!("No plugins configured, the gateway will route nothing");
        } else if origins.is_empty() {
            warn!("No memory-origin plugin configured, nothing can submit requests");
        }

        Ok(Self {
            manager,
            config,
            origins,
        })
    }
}

/// Run the gateway until ctrl-c.
///
/// # Errors
///
/// Returns an error if the gateway fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    state.manager.start().await?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_sampler(
            state.manager.clone(),
            Duration::from_millis(config.metrics.sample_interval_ms),
        );
    }

    let app = router(state.clone());
    info!(
        "Gateway listening on {} with protocols [{}]",
        addr,
        state
            .manager
            .protocols()
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.manager.stop().await?;
    served?;
    info!("Gateway stopped");
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/plugins", get(plugins_handler))
        .route("/origins/:protocol/requests", post(submit_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.manager.is_running() { "ok" } else { "stopped" },
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.manager.stats();
    Json(serde_json::json!({
        "plugins": stats.plugins,
        "pending_replies": stats.pending_replies,
        "subscriptions": {
            "uris": stats.subscriptions.uri_count,
            "standing": stats.subscriptions.standing,
            "one_shot": stats.subscriptions.one_shot,
        },
        "forwarded": stats.forwarded,
        "dropped": stats.dropped,
        "faults": stats.faults,
        "unmatched": stats.unmatched,
        "cache_enabled": state.config.cache.enabled,
    }))
}

async fn plugins_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let plugins: Vec<_> = state
        .config
        .plugins
        .iter()
        .map(|(name, plugin)| {
            serde_json::json!({
                "name": name,
                "protocol": plugin.protocol_name(name).to_ascii_lowercase(),
                "kind": plugin.kind,
            })
        })
        .collect();
    Json(serde_json::json!({ "plugins": plugins }))
}

/// A request submitted through an origin plugin.
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    operation: Operation,
    path: String,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitReply {
    sequence: Sequence,
    operation: Operation,
    payload: String,
}

#[derive(Debug, Serialize)]
struct SubmitError {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<Reason>,
}

type SubmitFailure = (StatusCode, Json<SubmitError>);

fn submit_error(status: StatusCode, error: impl ToString, reason: Option<Reason>) -> SubmitFailure {
    (
        status,
        Json(SubmitError {
            error: error.to_string(),
            reason,
        }),
    )
}

/// Send a request into the gateway as `protocol` and wait for the reply.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Path(protocol): Path<String>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<SubmitReply>, SubmitFailure> {
    let origin = state
        .origins
        .get(&protocol.to_ascii_lowercase())
        .ok_or_else(|| {
            submit_error(
                StatusCode::NOT_FOUND,
                format!("No origin plugin for protocol {protocol}"),
                None,
            )
        })?;

    let mut request = Request::new(body.operation, body.path);
    if let Some(payload) = body.payload {
        request = request.with_payload(payload.into_bytes());
    }
    debug!(protocol = %protocol, operation = %body.operation, "Submitting request");

    let outcome = match origin.request(request).await {
        Ok(pending) => pending.wait(SUBMIT_TIMEOUT).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(reply) => Ok(Json(SubmitReply {
            sequence: reply.sequence(),
            operation: reply.headers().operation(),
            payload: String::from_utf8_lossy(reply.payload().as_bytes()).into_owned(),
        })),
        Err(LinkError::Rejected(error)) => Err(submit_error(
            StatusCode::BAD_GATEWAY,
            format!("Request failed: {:?}", error.reason()),
            Some(error.reason()),
        )),
        Err(e @ LinkError::Timeout(_)) => Err(submit_error(StatusCode::GATEWAY_TIMEOUT, e, None)),
        Err(e @ LinkError::Protocol(_)) => Err(submit_error(StatusCode::BAD_REQUEST, e, None)),
        Err(e) => Err(submit_error(StatusCode::SERVICE_UNAVAILABLE, e, None)),
    }
}
