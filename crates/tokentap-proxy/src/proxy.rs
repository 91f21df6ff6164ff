//! The interception proxy server and its lifecycle.
//!
//! Wraps the MITM engine with the flow controller, exposes a background
//! handle for shutdown, and runs the signal loop: SIGHUP reloads the
//! provider registry, SIGTERM/SIGINT stop the proxy and drain the sink
//! within a grace period.

use std::net::SocketAddr;
use std::time::Duration;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::sync::broadcast;

use tokentap_core::provider::RegistryHandle;
use tokentap_storage::EventSink;

use crate::ca::CertAuthority;
use crate::error::{ProxyError, Result};
use crate::handler::{FlowController, HandlerConfig};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Default shutdown grace period.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Root CA used to sign interception certificates.
    pub ca: CertAuthority,
    /// Flow controller configuration.
    pub handler: HandlerConfig,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("ca", &self.ca)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration binding per the security gate's network mode.
    pub fn new(handler: HandlerConfig) -> Result<Self> {
        let ca = CertAuthority::in_default_location()?;
        let bind_ip = handler.security.network_mode().bind_ip();

        Ok(Self {
            addr: SocketAddr::new(bind_ip, DEFAULT_PROXY_PORT),
            ca,
            handler,
        })
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port, keeping the configured bind IP.
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Sets the root CA location.
    pub fn with_authority(mut self, ca: CertAuthority) -> Self {
        self.ca = ca;
        self
    }
}

/// The TLS-terminating interception proxy.
pub struct ProxyServer {
    config: ProxyConfig,
}

impl ProxyServer {
    /// Creates a new proxy server, provisioning the root CA if missing.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.ca.provision()?;
        Ok(Self { config })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for client trust installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.ca.cert_path().to_path_buf()
    }

    /// Starts the proxy server and blocks until it stops.
    pub async fn run(self) -> Result<()> {
        let authority = self.config.ca.provision()?;
        let handler = FlowController::new(self.config.handler.clone());

        tracing::info!("starting interception proxy on {}", self.config.addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        let proxy = Proxy::builder()
            .with_addr(self.config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown_tx_clone = shutdown_tx.clone();
        let addr = self.config.addr;

        let authority = self.config.ca.provision()?;
        let handler_config = self.config.handler.clone();

        let handle = tokio::spawn(async move {
            let handler = FlowController::new(handler_config);

            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("failed to build proxy: {e}");
                    return;
                }
            };

            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("proxy error: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx: shutdown_tx_clone,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

/// The running sidecar: proxy plus the resources the signal loop controls.
pub struct Sidecar {
    pub proxy: ProxyHandle,
    pub registry: RegistryHandle,
    pub sink: EventSink,
    /// In-flight grace before the sink is force-drained.
    pub grace: Duration,
}

impl Sidecar {
    /// Runs until a termination signal arrives, then shuts down in order:
    /// stop accepting flows, wait out the grace period, drain the sink.
    ///
    /// SIGHUP triggers a registry reload without interrupting traffic.
    pub async fn run(self) -> Result<()> {
        self.wait_for_shutdown_signal().await?;

        tracing::info!("shutting down: stopping proxy");
        self.proxy.stop().await;

        tracing::info!("draining event sink (grace {:?})", self.grace);
        self.sink.drain(self.grace).await;

        tracing::info!("shutdown complete");
        Ok(())
    }

    #[cfg(unix)]
    async fn wait_for_shutdown_signal(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP received, reloading provider registry");
                    if let Err(e) = self.registry.reload() {
                        tracing::warn!("registry reload failed, keeping previous snapshot: {e}");
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received");
                    return Ok(());
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received");
                    return Ok(());
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown_signal(&self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("ctrl-c received");
        Ok(())
    }
}
