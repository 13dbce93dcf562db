//! Baton Node
//!
//! One participant in an actor election. Every node in a domain points at the
//! same Redis and namespace; exactly one of them runs `node.command`.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BATON_CONFIG` | - | Path to a TOML config file |
//! | `BATON_REDIS_URL` | `redis://localhost:6379` | Redis connection URL |
//! | `BATON_NAMESPACE` | `baton` | Election namespace |
//! | `BATON_INSTANCE_ID` | random UUID | Identity of this node |
//! | `BATON_HTTP_PORT` | `9090` | Health/metrics port |
//! | `BATON_NODE_COMMAND` | - | Shell command run once when elected |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use baton_config::AppConfig;
use baton_election::{
    ActorElection, ElectionConfig, RedisBackendConfig, RedisRace, RedisStore, Role,
};

#[derive(Clone)]
struct AppState {
    election: Arc<ActorElection>,
    metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    baton_common::logging::init_logging("baton-node");

    info!("Starting Baton Node");

    let config = AppConfig::load()?;
    let instance_id = if config.election.instance_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.election.instance_id.clone()
    };

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let election_config = election_config(&config, &instance_id);
    let backend_config = RedisBackendConfig::new(config.redis.url.clone())
        .with_key_prefix(config.redis.key_prefix.clone())
        .with_channel(config.redis.channel.clone())
        .with_lease(Duration::from_millis(config.redis.lease_ms))
        .with_instance_id(instance_id.clone());

    info!(redis_url = %config.redis.url, "Connecting to Redis");
    let store = RedisStore::connect(backend_config.clone()).await?;
    let race = RedisRace::connect(backend_config).await?;

    let election = Arc::new(ActorElection::new(
        election_config,
        Arc::new(store),
        Arc::new(race),
    )?);

    let command = config.node.command.clone();
    let acting_id = instance_id.clone();
    election
        .join(move || {
            info!(instance_id = %acting_id, "This node is now the actor");
            if !command.is_empty() {
                tokio::spawn(run_command(command));
            }
        })
        .await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Health and metrics server
    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let app = Router::new()
        .route("/q/health", get(health_handler))
        .route("/q/health/live", get(liveness_handler))
        .route("/q/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState {
            election: election.clone(),
            metrics,
        });

    info!("Health server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!(
        instance_id = %instance_id,
        role = ?election.role(),
        "Baton Node started"
    );
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Announces the vacancy when this node was acting
    election.shutdown().await;

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(10), server_handle).await;

    info!("Baton Node shutdown complete");
    Ok(())
}

fn election_config(config: &AppConfig, instance_id: &str) -> ElectionConfig {
    let settings = &config.election;
    ElectionConfig::new(instance_id)
        .with_namespace(&settings.namespace)
        .with_heartbeat_interval(Duration::from_millis(settings.heartbeat_interval_ms))
        .with_missed_heartbeats(settings.missed_heartbeats)
        .with_poll_interval(Duration::from_millis(settings.poll_interval_ms))
        .with_settle_delay(Duration::from_millis(settings.settle_delay_ms))
}

async fn run_command(command: String) {
    info!(command = %command, "Running actor command");

    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .await;

    match status {
        Ok(status) if status.success() => info!(command = %command, "Actor command finished"),
        Ok(status) => warn!(command = %command, code = ?status.code(), "Actor command failed"),
        Err(e) => error!(command = %command, error = %e, "Failed to start actor command"),
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Candidate => "CANDIDATE",
        Role::Acting => "ACTING",
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "role": role_name(state.election.role()),
        "instance_id": state.election.instance_id(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Ready once joined; candidates are ready too, they are the standby.
async fn readiness_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "READY",
        "role": role_name(state.election.role())
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
