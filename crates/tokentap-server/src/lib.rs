//! Tokentap Server - the dashboard HTTP API.
//!
//! Read-only query surface over the event store plus two destructive
//! endpoints guarded by the admin token.
//!
//! ## Endpoints
//!
//! - `GET /api/events` - event listing with filters and pagination
//! - `GET /api/events/{id}` - one event
//! - `DELETE /api/events/all` - wipe events (admin token)
//! - `GET /api/usage` - aggregate token totals
//! - `GET /api/usage/{models,programs,projects,devices}` - breakdowns
//! - `GET /api/devices` - observed devices
//! - `PUT /api/devices/{id}` - name a device
//! - `DELETE /api/devices/{id}` - remove a device registration (admin token)
//! - `GET /api/status` - pipeline counters and operator modes

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::SocketAddr;

use axum::routing::{delete, get, put};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, Result};
pub use handlers::ADMIN_TOKEN_HEADER;
pub use state::AppState;

/// Default dashboard API port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default server host (localhost only; the security gate widens it).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The dashboard API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server over the given state.
    pub fn new(config: ServerConfig, state: AppState) -> std::result::Result<Self, ServerError> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let router = build_router(state).layer(cors);

        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {e}")))?;

        Ok(Self { router, addr })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("starting dashboard API on {}", self.addr);

        // SO_REUSEADDR so restarts do not trip over lingering sockets.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/events", get(handlers::get_events))
        .route("/api/events/all", delete(handlers::delete_all_events))
        .route("/api/events/{id}", get(handlers::get_event))
        .route("/api/usage", get(handlers::get_usage))
        .route("/api/usage/models", get(handlers::usage_by_model))
        .route("/api/usage/programs", get(handlers::usage_by_program))
        .route("/api/usage/projects", get(handlers::usage_by_project))
        .route("/api/usage/devices", get(handlers::usage_by_device))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/devices/{id}", put(handlers::register_device))
        .route("/api/devices/{id}", delete(handlers::delete_device))
        .route("/api/status", get(handlers::get_status))
        .with_state(state)
}
