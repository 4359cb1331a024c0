//! Connection management for the test server
//!
//! Bounds the number of live connections and runs the request loop for
//! each one.

use crate::framing::{read_message, write_message};
use crate::session::Session;
use crate::state::ServerState;
use docwire_core::{DocWireError, DocWireResult};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connections idle this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ConnectionManager {
    max_connections: Arc<Semaphore>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    /// Serves one client until it disconnects or `shutdown` fires.
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        state: Arc<ServerState>,
        shutdown: CancellationToken,
    ) -> DocWireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _permit = self
            .max_connections
            .acquire()
            .await
            .map_err(|_| DocWireError::Connection("connection limit reached".to_string()))?;

        Connection::new(stream, state, shutdown).run().await
    }
}

struct Connection<S> {
    id: Uuid,
    stream: S,
    session: Session,
    shutdown: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, state: Arc<ServerState>, shutdown: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            session: Session::new(state),
            shutdown,
        }
    }

    async fn run(mut self) -> DocWireResult<()> {
        debug!("connection {} started (session {})", self.id, self.session.id);

        loop {
            tokio::select! {
                message = read_message(&mut self.stream) => {
                    match message {
                        Ok(Some((header, body))) => {
                            let reply = match self.session.handle(&header, &body) {
                                Ok(reply) => reply,
                                Err(e) => {
                                    // Malformed requests end the connection.
                                    warn!("connection {} sent a bad request: {}", self.id, e);
                                    break;
                                }
                            };
                            if let Some(reply) = reply {
                                if let Err(e) = write_message(&mut self.stream, &reply).await {
                                    warn!("connection {} write failed: {}", self.id, e);
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("connection {} read failed: {}", self.id, e);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                    info!("connection {} timed out due to inactivity", self.id);
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("connection {} shutdown requested", self.id);
                    break;
                }
            }
        }

        debug!("connection {} closed", self.id);
        Ok(())
    }
}
