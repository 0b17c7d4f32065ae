#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use idreset_adapter::{AdapterReply, AdapterRuntime, ApiEnvelope};
use idreset_kernel_contracts::identity::ResetRequest;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type SharedRuntime = Arc<AdapterRuntime>;

#[derive(Parser, Debug)]
#[command(
    name = "idreset_http",
    about = "Local HTTP service for resetting application identifiers"
)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "IDRESET_HTTP_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let relaunch_args = vec!["--bind".to_string(), args.bind.to_string()];
    let runtime: SharedRuntime = Arc::new(AdapterRuntime::default_from_env(relaunch_args));
    info!(
        platform = %runtime.host().platform,
        storage = %runtime.host().storage_path.display(),
        "identity reset runtime ready"
    );

    let app = Router::new()
        .route("/api/system-info", get(system_info))
        .route("/api/config", get(config))
        .route("/api/reset", post(reset))
        .route("/api/kill-cursor", post(kill_application))
        .route("/api/check-cursor", get(check_application))
        .route("/api/generate-ids", post(generate_ids))
        .route("/api/elevate", post(elevate))
        .route("/api/disable-autoupdate", post(disable_auto_update))
        .route("/api/health", get(health))
        .with_state(runtime);

    info!(addr = %args.bind, "idreset_http listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("idreset_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to register SIGTERM handler");
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
    info!("shutdown requested");
}

fn respond(reply: AdapterReply) -> (StatusCode, Json<ApiEnvelope>) {
    (reply.status, Json(reply.body))
}

/// Runs `op` on the blocking pool; mutating operations sleep and touch the filesystem.
async fn blocking(
    runtime: SharedRuntime,
    op: impl FnOnce(&AdapterRuntime) -> AdapterReply + Send + 'static,
) -> (StatusCode, Json<ApiEnvelope>) {
    match tokio::task::spawn_blocking(move || op(runtime.as_ref())).await {
        Ok(reply) => respond(reply),
        Err(err) => {
            error!(error = %err, "blocking task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiEnvelope {
                    success: false,
                    error: Some("internal task failure".to_string()),
                    ..ApiEnvelope::default()
                }),
            )
        }
    }
}

async fn system_info(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<ApiEnvelope>) {
    blocking(runtime, AdapterRuntime::system_info).await
}

async fn config(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<ApiEnvelope>) {
    respond(runtime.config())
}

async fn reset(
    State(runtime): State<SharedRuntime>,
    body: Result<Json<ResetRequest>, JsonRejection>,
) -> (StatusCode, Json<ApiEnvelope>) {
    match body {
        Ok(Json(request)) => blocking(runtime, move |rt| rt.reset(request)).await,
        Err(rejection) => respond(runtime.invalid_request(rejection.body_text())),
    }
}

async fn kill_application(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<ApiEnvelope>) {
    blocking(runtime, AdapterRuntime::kill_application).await
}

async fn check_application(
    State(runtime): State<SharedRuntime>,
) -> (StatusCode, Json<ApiEnvelope>) {
    blocking(runtime, AdapterRuntime::check_application).await
}

async fn generate_ids(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<ApiEnvelope>) {
    respond(runtime.generate_ids())
}

async fn elevate(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<ApiEnvelope>) {
    blocking(runtime, AdapterRuntime::elevate).await
}

async fn disable_auto_update(
    State(runtime): State<SharedRuntime>,
) -> (StatusCode, Json<ApiEnvelope>) {
    blocking(runtime, AdapterRuntime::disable_auto_update).await
}

async fn health(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<ApiEnvelope>) {
    respond(runtime.health())
}
