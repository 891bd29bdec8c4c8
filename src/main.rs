use std::sync::Arc;

use axum::http::Method;
use clap::Parser;
use smartmarks::auth::SessionService;
use smartmarks::config::{Cli, Config, default_config_dir, default_config_path};
use smartmarks::db::Database;
use smartmarks::feed::FeedHub;
use smartmarks::handler::AppState;
use smartmarks::routes;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    dotenvy::dotenv().ok();

    // With --config, data (the database) lives next to the config file.
    // Otherwise both live in ~/.smartmarks/.
    let (config_path, data_dir) = match args.config_path {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            (path, dir)
        }
        None => (default_config_path(), default_config_dir()),
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("smartmarks.svc starting");

    let cfg = Config::new(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?config_path, "failed to load config file");
        std::process::exit(1);
    });

    let feed = FeedHub::new(cfg.app.feed_capacity);
    let db = Arc::new(Database::new(&cfg, &data_dir, feed.clone()).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup database");
        std::process::exit(1);
    }));
    let auth = Arc::new(SessionService::new(db.clone(), cfg.auth.session_ttl_hours));

    if cfg.auth.exchange_secret.is_none() {
        tracing::warn!("auth.exchange_secret is not set, session exchange is disabled");
    }

    let address = format!("0.0.0.0:{}", cfg.app.get_port());
    let cancellation_token = CancellationToken::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    // Periodic maintenance: drop expired sessions and push replica writes.
    let maintenance_db = db.clone();
    let maintenance_auth = auth.clone();
    let maintenance_token = cancellation_token.clone();
    let maintenance_done = shutdown_complete_tx.clone();
    let interval_secs = cfg.app.sync_interval_seconds.max(1);
    tokio::spawn(async move {
        let _done = maintenance_done;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match maintenance_auth.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => tracing::info!(purged, "purged expired sessions"),
                        Err(e) => tracing::warn!("failed to purge expired sessions: {}", e),
                    }
                    if let Err(e) = maintenance_db.sync().await {
                        tracing::warn!("failed to sync replica: {}", e);
                    }
                }
                _ = maintenance_token.cancelled() => {
                    tracing::info!("maintenance task shutting down");
                    break;
                }
            }
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = routes::routes().layer(cors).with_state(AppState {
        db,
        feed: feed.clone(),
        auth,
        exchange_secret: cfg.auth.exchange_secret.as_deref().map(Arc::from),
    });

    let listener = tokio::net::TcpListener::bind(&address).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup tcp listener");
        std::process::exit(1);
    });

    tracing::info!("smartmarks.svc running on {}", &address);
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server exited with error");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("ctrl+c signal received, preparing to shutdown");
            feed.close();
            cancellation_token.cancel();
        }
    }

    drop(shutdown_complete_tx);
    shutdown_complete_rx.recv().await;
    tracing::info!("smartmarks.svc going off, graceful shutdown complete");
}
