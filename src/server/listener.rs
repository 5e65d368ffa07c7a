//! Control server listener
//!
//! Handles TCP accept loop and spawns connection handlers. Also owns the
//! background loops of the router (liveness monitor and reconcile sweep)
//! for as long as the server runs.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::liveness::LivenessMonitor;
use crate::router::MessageRouter;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;

/// Control API server
pub struct ControlServer {
    config: ServerConfig,
    router: Arc<MessageRouter>,
    liveness: Arc<LivenessMonitor>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl ControlServer {
    /// Create a new server around a router
    pub fn new(config: ServerConfig, router: Arc<MessageRouter>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            liveness: Arc::new(LivenessMonitor::new(Arc::clone(&router))),
            config,
            router,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Get a reference to the router
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Control server listening");

        let background = self.spawn_background_tasks();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        // Stop background loops, then release broker subscriptions
        for handle in background {
            handle.abort();
        }
        self.router.shutdown().await;

        result
    }

    fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.config.liveness_enabled {
            handles.push(self.liveness.spawn());
        }
        if self.config.reconcile_enabled {
            handles.push(self.router.spawn_reconcile_task());
        }
        handles
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let config = self.config.clone();
        let router = Arc::clone(&self.router);

        tokio::spawn(async move {
            // Held for the lifetime of the connection
            let _permit = permit;
            let mut connection = Connection::new(session_id, socket, peer_addr, config, router);

            if let Err(e) = connection.run().await {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
