//! The test server's accept loop
//!
//! Owns the shared state and hands each accepted socket to the
//! connection manager until shutdown is requested.

use crate::config::ServerConfig;
use crate::connection_manager::ConnectionManager;
use crate::state::ServerState;
use docwire_core::{DocWireError, DocWireResult};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct DatabaseServer {
    state: Arc<ServerState>,
    connection_manager: Arc<ConnectionManager>,
    shutdown_token: CancellationToken,
}

impl DatabaseServer {
    pub fn new(config: ServerConfig) -> Self {
        let connection_manager = Arc::new(ConnectionManager::new(config.max_connections));
        Self {
            state: Arc::new(ServerState::new(config)),
            connection_manager,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Binds the configured TCP address.
    pub async fn bind(&self) -> DocWireResult<TcpListener> {
        let address = self.state.config().address();
        TcpListener::bind(&address)
            .await
            .map_err(|e| DocWireError::Connection(format!("cannot bind {}: {}", address, e)))
    }

    /// Binds and serves TCP, plus the unix socket when one is configured.
    pub async fn start(&self) -> DocWireResult<()> {
        let listener = self.bind().await?;

        #[cfg(unix)]
        if let Some(path) = self.state.config().unix_socket {
            let _ = std::fs::remove_file(&path);
            let unix = tokio::net::UnixListener::bind(&path).map_err(DocWireError::from_io)?;
            info!("listening on {}", path.display());
            let (tcp, unix) = tokio::join!(self.serve(listener), self.serve_unix(unix));
            return tcp.and(unix);
        }

        self.serve(listener).await
    }

    /// Accepts TCP connections until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> DocWireResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("docwired listening on {}", addr);
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            debug!("new connection from {}", addr);
                            let _ = socket.set_nodelay(true);
                            self.spawn_connection(socket);
                        }
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("shutdown signal received, stopping connection acceptance");
                    break;
                }
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    pub async fn serve_unix(&self, listener: tokio::net::UnixListener) -> DocWireResult<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, _)) => {
                            debug!("new unix socket connection");
                            self.spawn_connection(socket);
                        }
                        Err(e) => error!("failed to accept unix connection: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => break,
            }
        }
        Ok(())
    }

    fn spawn_connection<S>(&self, socket: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let connection_manager = Arc::clone(&self.connection_manager);
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown_token.child_token();
        tokio::spawn(async move {
            if let Err(e) = connection_manager
                .handle_connection(socket, state, shutdown)
                .await
            {
                error!("error handling connection: {}", e);
            }
        });
    }

    pub fn shutdown(&self) {
        info!("shutting down docwired");
        self.shutdown_token.cancel();
    }

    /// Token for external shutdown coordination.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
