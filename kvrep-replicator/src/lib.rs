pub mod error;
pub mod http;
pub mod state;
pub mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use kvrep_aws_sm::{RolesAnywhereBroker, RolesAnywhereConfig, SecretsManagerTarget};
use kvrep_azure::{BlobDedupeGate, KeyVaultSource, http_client};
use kvrep_core::{Replicator, SourceStore, SystemClock};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use state::AppState;
pub use telemetry::CorrelationId;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub http_addr: SocketAddr,
}

pub async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    let state = build_state().await?;

    let listener = TcpListener::bind(config.http_addr).await.with_context(|| {
        format!(
            "failed to bind http listener on {addr}",
            addr = config.http_addr
        )
    })?;

    let http_addr = listener.local_addr()?;
    info!(%http_addr, "http server listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wire the live providers into a shared pipeline.
pub async fn build_state() -> anyhow::Result<AppState> {
    let client = http_client()?;
    let source: Arc<dyn SourceStore> = Arc::new(
        KeyVaultSource::from_env(client.clone()).context("failed to build key vault source")?,
    );
    let dedupe = Arc::new(
        BlobDedupeGate::from_env(client).context("failed to build blob dedupe gate")?,
    );
    let credentials = Arc::new(RolesAnywhereBroker::new(
        RolesAnywhereConfig::from_env().context("failed to load roles anywhere configuration")?,
        source.clone(),
        Arc::new(SystemClock),
    ));
    let target =
        Arc::new(SecretsManagerTarget::from_env().context("failed to build target store")?);

    let replicator = Replicator::new(source, dedupe, credentials, target);
    Ok(AppState::new(Arc::new(replicator)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
