use std::sync::Arc;

use cloudbridge::modules;
use cloudbridge::proxy;

#[tokio::main]
async fn main() -> Result<(), String> {
    modules::logger::init_logger();

    let document = match modules::store::load_document() {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!("failed to load account store: {}. starting with defaults", e);
            modules::store::AccountsDocument::default()
        }
    };

    let mut config = document.settings.clone();

    if let Ok(value) = std::env::var("CLOUDBRIDGE_ALLOW_LAN") {
        if matches!(value.as_str(), "1" | "true" | "yes" | "on") {
            config.allow_lan_access = true;
        }
    }

    let bind_address = if let Ok(addr) = std::env::var("CLOUDBRIDGE_BIND") {
        if addr != "127.0.0.1" && addr != "localhost" {
            config.allow_lan_access = true;
        }
        addr
    } else {
        config.bind_address().to_string()
    };

    let port = std::env::var("CLOUDBRIDGE_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.port);

    let store = Arc::new(proxy::AccountStore::from_document(&document));
    if store.is_empty() {
        tracing::warn!("no accounts found; requests will fail until enrollment adds accounts");
    }

    let pins = Arc::new(proxy::sticky::StickyPins::with_idle_expiry(
        std::time::Duration::from_secs(config.scheduling.pin_idle_seconds),
    ));
    let upstream = Arc::new(proxy::upstream::UpstreamClient::new(Some(
        config.upstream_proxy.clone(),
    )));

    let scheduler = Arc::new(proxy::Scheduler::new(
        Arc::clone(&store),
        pins,
        upstream,
        config.fallback_model.clone(),
        std::time::Duration::from_secs(config.request_timeout),
        std::time::Duration::from_secs(config.stream_timeout),
        &config.scheduling,
    ));

    // Proactive token refresh + idle housekeeping
    let tick = proxy::token_registry::spawn_background_tick(Arc::clone(&store));

    let (server, handle) = proxy::AxumServer::start(bind_address.clone(), port, scheduler)
        .await
        .map_err(|e| format!("failed to start proxy server: {}", e))?;

    tracing::info!(
        "cloudbridge ready on http://{}:{} ({} accounts)",
        bind_address,
        port,
        store.len()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutdown requested, stopping server...");
    tick.abort();
    server.stop();
    let _ = handle.await;

    Ok(())
}
