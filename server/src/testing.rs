//! In-process server for driver tests
//!
//! Runs [`DatabaseServer`] on its own tokio runtime thread, bound to an
//! ephemeral port, and stops it when dropped.

use crate::config::ServerConfig;
use crate::database_server::DatabaseServer;
use crate::state::ServerState;
use docwire_core::{DocWireError, DocWireResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct TestServer {
    port: u16,
    state: Arc<ServerState>,
    unix_socket: Option<PathBuf>,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Starts a primary with default settings.
    pub fn start() -> DocWireResult<Self> {
        Self::with_config(ServerConfig::default())
    }

    /// Starts a server with `config`. The port is always chosen by the OS.
    pub fn with_config(mut config: ServerConfig) -> DocWireResult<Self> {
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        let unix_socket = config.unix_socket.clone();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(DocWireError::from_io)?;
        let server = DatabaseServer::new(config);
        let state = server.state();
        let shutdown = server.shutdown_token();

        let (ready_tx, ready_rx) = mpsc::channel::<DocWireResult<u16>>();
        let thread = std::thread::spawn(move || {
            runtime.block_on(async move {
                let listener = match server.bind().await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let port = match listener.local_addr() {
                    Ok(addr) => addr.port(),
                    Err(e) => {
                        let _ = ready_tx.send(Err(DocWireError::from_io(e)));
                        return;
                    }
                };

                #[cfg(unix)]
                let unix = match server.state().config().unix_socket {
                    Some(path) => {
                        let _ = std::fs::remove_file(&path);
                        match tokio::net::UnixListener::bind(&path) {
                            Ok(unix) => Some(unix),
                            Err(e) => {
                                let _ = ready_tx.send(Err(DocWireError::from_io(e)));
                                return;
                            }
                        }
                    }
                    None => None,
                };

                let _ = ready_tx.send(Ok(port));

                #[cfg(unix)]
                if let Some(unix) = unix {
                    let (tcp, unix) = tokio::join!(server.serve(listener), server.serve_unix(unix));
                    if let Err(e) = tcp.and(unix) {
                        warn!("test server stopped with error: {}", e);
                    }
                    return;
                }

                if let Err(e) = server.serve(listener).await {
                    warn!("test server stopped with error: {}", e);
                }
            });
        });

        let port = ready_rx
            .recv()
            .map_err(|_| DocWireError::Connection("test server thread exited".to_string()))??;

        Ok(Self {
            port,
            state,
            unix_socket,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `127.0.0.1:<port>`, the form replica set members are listed in.
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn unix_socket(&self) -> Option<&Path> {
        self.unix_socket.as_deref()
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Changes what the running server reports, e.g. its replica set role.
    pub fn update_config(&self, f: impl FnOnce(&mut ServerConfig)) {
        self.state.update_config(f);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Some(path) = &self.unix_socket {
            let _ = std::fs::remove_file(path);
        }
    }
}
