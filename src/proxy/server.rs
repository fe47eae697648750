use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::proxy::handlers;
use crate::proxy::middleware;
use crate::proxy::Scheduler;

/// Per-text-block cap is 1 MiB and image data 10 MiB; 50 MiB bounds a
/// maximal request with headroom.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AxumServer {
    pub async fn start(
        host: String,
        port: u16,
        scheduler: Arc<Scheduler>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let state = AppState { scheduler };

        let app = Router::new()
            // Anthropic-compatible surface
            .route("/v1/messages", post(handlers::claude::handle_messages))
            .route(
                "/v1/messages/count_tokens",
                post(handlers::claude::handle_count_tokens),
            )
            .route("/v1/models", get(handlers::claude::handle_list_models))
            // Operational surface
            .route("/health", get(handlers::health::handle_health))
            .route("/account-limits", get(handlers::health::handle_account_limits))
            .route("/refresh-token", post(handlers::health::handle_refresh_token))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::cors_layer())
            .with_state(state);

        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("failed to bind {}: {}", addr, e))?;

        tracing::info!("proxy listening on http://{}", addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("connection closed: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("accept failed: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("proxy server stopping");
                        break;
                    }
                }
            }
        });

        Ok((Self { shutdown_tx: Some(shutdown_tx) }, handle))
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
