use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};

use deckterm_terminal::{
    spawn_idle_reaper, NativePtySpawner, PersistenceBackend, PersistenceBackendType, PtySpawner,
    TerminalManager, TmuxBackend,
};

use super::routes::{self, AppState};
use super::upstream::UpstreamProxy;
use crate::config::ServerConfig;

/// Web server instance
pub struct WebServer {
    config: ServerConfig,
    manager: Arc<TerminalManager>,
    upstream: Option<Arc<UpstreamProxy>>,
}

impl WebServer {
    /// Build the server with the native PTY spawner and the configured persistence backend
    ///
    /// A tmux backend that cannot be started is logged and replaced by plain PTYs.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let persistence: Option<Arc<dyn PersistenceBackend>> = match config.persistence {
            PersistenceBackendType::None => None,
            PersistenceBackendType::Tmux => {
                match TmuxBackend::new(config.persistence_prefix.clone(), config.persistence_timeout)
                    .await
                {
                    Ok(backend) => Some(Arc::new(backend)),
                    Err(e) => {
                        warn!(error = %format!("{:#}", e), "tmux persistence unavailable, sessions will not survive restarts");
                        None
                    }
                }
            }
        };
        Self::with_parts(config, Arc::new(NativePtySpawner), persistence)
    }

    /// Build the server around an explicit spawner and backend
    pub fn with_parts(
        config: ServerConfig,
        spawner: Arc<dyn PtySpawner>,
        persistence: Option<Arc<dyn PersistenceBackend>>,
    ) -> Result<Self> {
        let manager = TerminalManager::new(config.manager.clone(), spawner, persistence);
        let upstream = config
            .upstream
            .as_ref()
            .map(|upstream| UpstreamProxy::new(upstream, config.identity.clone()).map(Arc::new))
            .transpose()?;
        Ok(Self {
            config,
            manager,
            upstream,
        })
    }

    pub fn manager(&self) -> Arc<TerminalManager> {
        self.manager.clone()
    }

    /// Router with every route and layer, without binding a socket
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            identity: Arc::new(self.config.identity.clone()),
            upstream: self.upstream.clone(),
        };

        let mut app = routes::create_router(state);

        // Serve static files if web_dir is provided
        if let Some(web_dir) = &self.config.web_dir {
            if web_dir.is_dir() {
                info!(dir = %web_dir.display(), "serving static files");
                app = app.fallback_service(ServeDir::new(web_dir));
            } else {
                warn!(dir = %web_dir.display(), "web directory does not exist, not serving static files");
            }
        }

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        app.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Recover persisted sessions, then serve until SIGINT/SIGTERM
    pub async fn start(self) -> Result<()> {
        let recovered = self.manager.recover().await;
        if recovered > 0 {
            info!(recovered, "recovered persistent sessions");
        }

        let shutdown = CancellationToken::new();
        let reaper = self.manager.config().idle_timeout.map(|_| {
            spawn_idle_reaper(self.manager.clone(), self.config.reap_interval, shutdown.clone())
        });

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        info!(addr = %self.config.bind_addr, "deckterm listening");
        info!("streaming endpoint: ws://{}/stream/terminals/{{id}}", self.config.bind_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;

        shutdown.cancel();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        let released = self.manager.shutdown().await;
        info!(released, "server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
