//! Synchronous client for the DocWire wire protocol
//!
//! A [`Connection`] talks to one server or to the primary of a replica
//! set. Queries return [`Cursor`]s borrowing the connection; files are
//! stored in chunks through [`GridFs`].

pub mod commands;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod gridfs;
pub mod host;
pub mod namespace;
pub mod write_concern;

pub use commands::{auth_key, index_flags, index_name, password_digest};
pub use config::{ConnectionConfig, DEFAULT_MAX_BSON_SIZE};
pub use connection::{Connection, ConnectionState, ServerError};
pub use cursor::{Cursor, CursorState};
pub use gridfs::{ChunkFilter, FileMode, GridFile, GridFs, GridFsConfig, Lz4Filter, file_flags};
pub use host::{DEFAULT_PORT, HostPort};
pub use write_concern::WriteConcern;

pub use docwire_core;
pub use docwire_core::network::{delete_flags, insert_flags, query_flags, update_flags};
pub use docwire_core::{Bson, DocWireError, DocWireResult, Oid, RawDoc};
