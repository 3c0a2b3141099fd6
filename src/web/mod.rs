//! HTTP surface
//!
//! Thin axum handlers over the service layer: playlist and EPG rendering,
//! byte streaming, segment serving, channel CRUD and process metrics.
//! Every route except `/metrics` requires the shared token when one is
//! configured.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{AppConfig, ServerConfig};
use crate::errors::AmpsError;
use crate::registry::ChannelRegistry;
use crate::relay::TranscoderManager;
use crate::scheduler::Scheduler;
use crate::services::ChannelService;

pub mod extractors;
pub mod handlers;
pub mod responses;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub server: ServerConfig,
    pub channels: Arc<ChannelService>,
    pub started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(server: ServerConfig, channels: Arc<ChannelService>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            server,
            channels,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        self.channels.registry()
    }

    pub fn manager(&self) -> &Arc<TranscoderManager> {
        self.channels.manager()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// Decode the raw query string into (key, value) pairs
pub fn query_pairs(uri: &axum::http::Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Token gate for every route except the open `/metrics`
async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.uri().path() == "/metrics" || !state.server.auth_enabled() {
        return next.run(request).await;
    }
    let query = query_pairs(request.uri());
    let presented = extractors::extract_token(request.headers(), &query);
    if presented.as_deref() == state.server.token.as_deref() {
        next.run(request).await
    } else {
        tracing::warn!(path = %request.uri().path(), "rejected request with missing or invalid token");
        AmpsError::Unauthorized.into_response()
    }
}

/// Build the full router; exposed for the integration tests
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/playlist.m3u", get(handlers::playlist::playlist))
        .route("/stream/:id", get(handlers::stream::stream))
        .route("/audio/:id", get(handlers::stream::audio))
        .route("/hls/:id/:file", get(handlers::segments::hls))
        .route("/dash/:id/:file", get(handlers::segments::dash))
        .route("/epg.xml", get(handlers::epg::epg_xml))
        .route("/api/epg", get(handlers::epg::epg_json))
        .route(
            "/api/streams",
            get(handlers::api::list_streams).post(handlers::api::add_stream),
        )
        .route(
            "/api/streams/:id",
            get(handlers::api::get_stream)
                .put(handlers::api::update_stream)
                .delete(handlers::api::delete_stream),
        )
        .route(
            "/api/streams/:id/programs",
            get(handlers::api::get_programs).put(handlers::api::put_programs),
        )
        .route("/api/tuners", get(handlers::api::tuners))
        .route("/api/shutdown", post(handlers::api::shutdown))
        .route("/metrics", get(handlers::api::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct WebServer {
    state: AppState,
    scheduler: Option<JoinHandle<()>>,
}

impl WebServer {
    /// Wire the full application from a validated configuration
    pub fn from_config(config: AppConfig) -> Self {
        let registry = Arc::new(ChannelRegistry::new(config.streams.clone()));
        let manager = TranscoderManager::from_config(&config);
        manager.start_sweeper();
        let channels = ChannelService::new(registry, manager);

        let scheduler = (!config.scheduled_streams.is_empty()).then(|| {
            Scheduler::new(config.scheduled_streams.clone(), Arc::clone(&channels)).spawn()
        });

        let state = AppState::new(config.server, channels);
        Self { state, scheduler }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until ctrl-c or an API shutdown request, then drain
    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.state.server.host, self.state.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("listening on http://{addr}");
        if self.state.server.auth_enabled() {
            info!("authentication: enabled");
        } else {
            info!("authentication: disabled (no token configured)");
        }

        let mut shutdown_rx = self.state.shutdown_signal();
        let app = create_router(self.state.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
                    _ = shutdown_rx.changed() => info!("shutdown requested over the API"),
                }
            })
            .await?;

        if let Some(scheduler) = self.scheduler {
            scheduler.abort();
        }
        self.state.manager().shutdown().await;
        info!("all transcoders stopped; goodbye");
        Ok(())
    }
}
