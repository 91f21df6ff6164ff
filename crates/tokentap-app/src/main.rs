//! Tokentap - observability sidecar for LLM API traffic.
//!
//! Runs the full sidecar:
//! - TLS-terminating interception proxy (token accounting)
//! - Event sink writing to the local event store
//! - Dashboard HTTP API over the store
//!
//! SIGHUP reloads the provider registry; SIGTERM/SIGINT shut down
//! gracefully, draining the sink last.

use std::sync::Arc;

use tokentap_core::context::ContextResolver;
use tokentap_core::counters::TapCounters;
use tokentap_core::provider::RegistryHandle;
use tokentap_core::security::SecurityGate;
use tokentap_proxy::{HandlerConfig, ProxyConfig, ProxyServer, Sidecar, DEFAULT_SHUTDOWN_GRACE};
use tokentap_server::{AppState, Server, ServerConfig};
use tokentap_storage::{Database, EventSink, SinkConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tokentap=info".parse().unwrap()),
        )
        .init();

    tracing::info!("starting tokentap...");

    // Security gate first: a compromised token file must abort startup.
    let security = match SecurityGate::load_default() {
        Ok(gate) => gate,
        Err(e) => {
            tracing::error!("security gate refused to start: {e}");
            std::process::exit(1);
        }
    };
    // Generate-or-verify the admin token up front, for the same reason.
    if let Err(e) = security.admin_token() {
        tracing::error!("admin token check failed: {e}");
        std::process::exit(1);
    }

    // Provider registry: bundled defaults with an operator override layer.
    let override_path = security.state_dir().join("providers.json");
    let registry = if override_path.exists() {
        let bundled_path = security.state_dir().join("providers.bundled.json");
        std::fs::write(&bundled_path, tokentap_core::provider::BUNDLED_PROVIDERS)?;
        RegistryHandle::from_files(bundled_path, Some(override_path))?
    } else {
        RegistryHandle::from_registry(tokentap_core::ProviderRegistry::bundled()?)
    };

    // Event store and sink.
    let db = Arc::new(Database::new()?);
    tracing::info!("event database opened at {:?}", Database::default_db_path()?);
    let sink = EventSink::spawn(db.clone(), SinkConfig::default());

    let counters = Arc::new(TapCounters::new());

    // Dashboard API in the background.
    let api_state = AppState::new(
        db.clone(),
        security.clone(),
        counters.clone(),
        sink.counters(),
    );
    let api_config =
        ServerConfig::default().with_host(security.network_mode().bind_ip().to_string());
    tokio::spawn(async move {
        match Server::new(api_config, api_state) {
            Ok(server) => {
                if let Err(e) = server.run().await {
                    tracing::error!("dashboard API error: {e}");
                }
            }
            Err(e) => {
                tracing::error!("failed to create dashboard API: {e}");
            }
        }
    });

    // Interception proxy.
    let handler = HandlerConfig {
        registry: registry.clone(),
        sink: sink.handle(),
        security: security.clone(),
        resolver: ContextResolver::from_env(),
        counters,
    };
    let proxy_config = ProxyConfig::new(handler)?;
    let proxy = ProxyServer::new(proxy_config)?;
    tracing::info!(
        "clients should set HTTPS_PROXY=http://{} and trust {:?}",
        proxy.addr(),
        proxy.ca_cert_path()
    );
    let proxy_handle = proxy.start()?;

    // Run until signalled; teardown drains the sink last.
    let sidecar = Sidecar {
        proxy: proxy_handle,
        registry,
        sink,
        grace: DEFAULT_SHUTDOWN_GRACE,
    };
    sidecar.run().await?;

    tracing::info!("tokentap stopped");
    Ok(())
}
