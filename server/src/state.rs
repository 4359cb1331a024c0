//! State shared by every connection

use crate::config::{ServerConfig, UserConfig};
use crate::store::Store;
use dashmap::DashMap;
use docwire_core::Bson;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{info, warn};

/// Open server-side cursor.
#[derive(Debug)]
pub enum ServerCursor {
    /// Snapshot of a result set, handed out in batches.
    Snapshot {
        ns: String,
        docs: Vec<Bson>,
        pos: usize,
        /// Documents returned before `docs[0]`.
        base: usize,
        remaining: Option<usize>,
    },
    /// Follows a collection in insertion order and stays open when it
    /// catches up.
    Tailable {
        ns: String,
        filter: Bson,
        last_seq: u64,
    },
}

pub struct ServerState {
    config: RwLock<ServerConfig>,
    pub store: Store,
    pub cursors: DashMap<i64, ServerCursor>,
    next_request_id: AtomicI32,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let state = Self {
            config: RwLock::new(config),
            store: Store::new(),
            cursors: DashMap::new(),
            next_request_id: AtomicI32::new(1),
        };
        let users = state.config.read().users.clone();
        for user in &users {
            if let Err(e) = state.add_user(user) {
                warn!("could not create user {} on {}: {}", user.user, user.db, e);
            }
        }
        state
    }

    fn add_user(&self, user: &UserConfig) -> anyhow::Result<()> {
        let digest = format!(
            "{:x}",
            md5::compute(format!("{}:mongo:{}", user.user, user.password))
        );
        let mut doc = Bson::new();
        doc.append_string("user", &user.user)?;
        doc.append_string("pwd", &digest)?;
        doc.finish()?;
        self.store
            .insert(&format!("{}.system.users", user.db), doc.view())?;
        info!("created user {} on {}", user.user, user.db);
        Ok(())
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut ServerConfig)) {
        f(&mut self.config.write());
    }

    pub fn next_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a cursor under a fresh nonzero id.
    pub fn open_cursor(&self, cursor: ServerCursor) -> i64 {
        loop {
            let id = rand::random::<i64>() & i64::MAX;
            if id == 0 || self.cursors.contains_key(&id) {
                continue;
            }
            self.cursors.insert(id, cursor);
            return id;
        }
    }
}
