use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use envpool::api::{self, AppState};
use envpool::auth::{AuthProvider, GitHubAuth, NoAuth, SessionRegistry};
use envpool::cluster::{ClusterStore, KubeStore};
use envpool::config::Config;
use envpool::pool::EnvPool;
use envpool::repo::{HttpRepoFetcher, RepoFetcher};
use envpool::template::Templates;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = match args.get(1) {
        Some(raw) => raw.parse().with_context(|| format!("invalid port: {raw}"))?,
        None => 8080,
    };

    let config = Config::from_env();
    // an unreadable template is fatal: nothing can be deployed without them
    let templates = Templates::load(&config.template_dir, config.host_path_volumes())
        .context("loading manifest templates")?;

    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::from_env(&config).await?);
    let fetcher: Arc<dyn RepoFetcher> = Arc::new(HttpRepoFetcher::new()?);
    let auth: Arc<dyn AuthProvider> = if config.github_auth_enabled() {
        info!("github authentication enabled");
        Arc::new(GitHubAuth::new(
            &config.github_client_id,
            &config.github_client_secret,
        )?)
    } else {
        info!("running without authentication");
        Arc::new(NoAuth)
    };

    let allow_origin = config.allow_origin.clone();
    let pool = Arc::new(EnvPool::new(store, fetcher, templates, config));
    pool.init().await.context("initialising environment pool")?;
    tokio::spawn(pool.clone().run_reconciler());

    let state = AppState {
        pool,
        auth,
        sessions: Arc::new(SessionRegistry::default()),
    };
    let app = api::router(state, &allow_origin);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
