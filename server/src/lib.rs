//! docwired - in-memory document server speaking the legacy wire protocol
//!
//! Serves the subset of operations the driver needs: CRUD with simple
//! query operators, server-side cursors (including tailable ones over
//! capped collections), indexes, write-error reporting, nonce
//! authentication, `filemd5` and replica-set discovery via `ismaster`.

mod commands;
pub mod config;
pub mod connection_manager;
pub mod database_server;
pub mod framing;
pub mod matcher;
pub mod session;
pub mod state;
pub mod store;
pub mod testing;

pub use config::{ServerConfig, UserConfig};
pub use connection_manager::ConnectionManager;
pub use database_server::DatabaseServer;
pub use session::Session;
pub use state::ServerState;
pub use store::{Store, StoreError, StoreResult};
pub use testing::TestServer;
