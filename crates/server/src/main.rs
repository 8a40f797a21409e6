use std::sync::Arc;

use anyhow::Context;
use recast_server::config::ServerConfig;
use recast_server::state::AppState;
use recast_transcoder::{ShutdownCoordinator, TaskRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RECAST_LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::from_env()?;
    anyhow::ensure!(
        config.root.is_dir(),
        "media directory {} does not exist",
        config.root.display()
    );
    let root = config
        .root
        .canonicalize()
        .context("failed to resolve media directory")?;
    if let Some(dir) = &config.transcoder.spill_dir {
        std::fs::create_dir_all(dir).context("failed to create spill dir")?;
    }

    let registry = TaskRegistry::new(config.transcoder);
    let coordinator = Arc::new(ShutdownCoordinator::new(registry.clone()));
    let signals = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    let app = recast_server::routes::build_router(AppState::new(root.clone(), registry));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(root = %root.display(), addr = %config.bind, "serving media directory");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(coordinator.token().cancelled_owned())
        .await;
    if let Err(e) = served {
        coordinator.shutdown().await;
        return Err(e).context("server error");
    }

    signals.await.context("shutdown task failed")?;
    info!("shutdown complete");
    Ok(())
}
