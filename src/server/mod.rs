//! Collector HTTP server: routes, ingestion middleware and lifecycle.

pub mod middleware;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use ipnet::IpNet;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::codec::{self, Stage, STAGES};
use crate::handlers::{
    metrics_handler, ping_handler, root_handler, update_json_handler, update_path_handler,
    updates_handler, value_json_handler, value_path_handler,
};
use crate::restorer::Restorer;
use crate::state::{AppState, SharedState};
use crate::storage::{self, StorageSettings};

/// Runtime settings of the collector, resolved from configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub address: String,
    pub storage: StorageSettings,
    /// Load the snapshot file before serving.
    pub restore: bool,
    pub hash_key: Option<String>,
    pub private_key: Option<PathBuf>,
    pub trusted_subnet: Option<IpNet>,
}

/// Registers `path` and `path/` with the same handler.
fn route_both(
    router: Router<SharedState>,
    path: &str,
    method: axum::routing::MethodRouter<SharedState>,
) -> Router<SharedState> {
    router
        .route(path, method.clone())
        .route(&format!("{path}/"), method)
}

/// Builds the collector router with the ingestion chain installed.
///
/// The chain decodes in the reverse of the agent's encoding order, so the
/// last encoding stage is the outermost layer.
pub fn router(state: SharedState) -> Router {
    let mut app = Router::new();
    app = route_both(app, "/update/{mtype}/{name}/{value}", post(update_path_handler));
    app = route_both(app, "/update", post(update_json_handler));
    app = route_both(app, "/updates", post(updates_handler));
    app = route_both(app, "/value/{mtype}/{name}", get(value_path_handler));
    app = route_both(app, "/value", post(value_json_handler));
    app = route_both(app, "/ping", get(ping_handler));
    app = route_both(app, "/metrics", get(metrics_handler));
    app = app.route("/", get(root_handler));

    let mut app = app.with_state(Arc::clone(&state));
    for stage in STAGES {
        let state = Arc::clone(&state);
        app = match stage {
            Stage::Compress => {
                app.layer(axum::middleware::from_fn_with_state(state, middleware::gzip))
            }
            Stage::Encrypt => app.layer(axum::middleware::from_fn_with_state(
                state,
                middleware::decrypt_body,
            )),
            Stage::Sign => app.layer(axum::middleware::from_fn_with_state(
                state,
                middleware::verify_signature,
            )),
        };
    }
    app.layer(axum::middleware::from_fn_with_state(
        state,
        middleware::trusted_subnet,
    ))
    .layer(axum::middleware::from_fn(middleware::access_log))
}

/// Serves `router(state)` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Runs the collector: opens storage, restores the snapshot, serves until
/// `shutdown` fires, then writes a final snapshot and closes storage.
pub async fn run(settings: ServerSettings, shutdown: CancellationToken) -> anyhow::Result<()> {
    let storage = storage::open(&settings.storage)
        .await
        .context("opening storage")?;

    let private_key = settings
        .private_key
        .as_deref()
        .map(codec::load_private_key)
        .transpose()
        .context("loading private key")?;

    let state = AppState::new(Arc::clone(&storage))
        .context("registering collector metrics")?
        .with_hash_key(settings.hash_key.clone())
        .with_private_key(private_key)
        .with_trusted_subnet(settings.trusted_subnet);
    let state = Arc::new(state);

    let restorer = match settings.storage.snapshot_path() {
        Some(path) => {
            let restorer = Restorer::new(
                Arc::clone(&storage),
                path.clone(),
                settings.storage.store_interval,
            )
            .with_metrics(state.metrics.clone());
            if settings.restore {
                restorer.load().await.context("restoring snapshot")?;
            }
            Some(tokio::spawn(restorer.run(shutdown.clone())))
        }
        None => None,
    };

    let listener = TcpListener::bind(&settings.address)
        .await
        .with_context(|| format!("binding {}", settings.address))?;
    info!(
        address = %settings.address,
        backend = storage.name(),
        signed = state.hash_key.is_some(),
        encrypted = state.private_key.is_some(),
        subnet = ?state.trusted_subnet,
        "Collector listening"
    );

    let served = serve(listener, state, shutdown.clone()).await;
    // The restorer writes its final dump once the token fires.
    shutdown.cancel();
    if let Some(task) = restorer {
        if let Err(e) = task.await {
            error!(error = %e, "Restorer task failed");
        }
    }
    if let Err(e) = storage.close().await {
        error!(error = %e, "Closing storage failed");
    }
    served.context("serving HTTP")?;

    info!("Collector stopped");
    Ok(())
}
