//! DocWire - binary document codec and wire protocol primitives

pub mod bson;
pub mod error;
pub mod network;
pub mod notation;

pub use bson::{
    Bson, BsonError, BsonIter, BsonResult, BsonType, Element, Oid, OidGenerator, RawDoc,
    Timestamp, ValidityFlags, Value,
};
pub use error::{DocWireError, DocWireResult, ErrorDomain};
pub use notation::{NotationError, Token, TypeSpec};

use std::fmt;
use std::sync::Arc;

/// Exit status used when an allocation failure reaches the fatal path
/// and no hook has been installed.
pub const FATAL_EXIT_CODE: i32 = -5;

/// Invoked on unrecoverable codec failures before the process would
/// otherwise exit.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Codec configuration
#[derive(Clone)]
pub struct CodecConfig {
    pub initial_capacity: usize,
    pub max_depth: usize,
    pub fatal_hook: Option<FatalHook>,
}

impl CodecConfig {
    pub fn with_fatal_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.fatal_hook = Some(Arc::new(hook));
        self
    }

    /// Reports an unrecoverable failure. With a hook installed the hook
    /// sees the message and the caller gets an error back; without one
    /// the process exits.
    pub(crate) fn fatal(&self, msg: &str) -> BsonError {
        tracing::error!("fatal codec error: {}", msg);
        match &self.fatal_hook {
            Some(hook) => {
                hook(msg);
                BsonError::Fatal(msg.to_string())
            }
            None => std::process::exit(FATAL_EXIT_CODE),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 128,
            max_depth: 64,
            fatal_hook: None,
        }
    }
}

impl fmt::Debug for CodecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecConfig")
            .field("initial_capacity", &self.initial_capacity)
            .field("max_depth", &self.max_depth)
            .field("fatal_hook", &self.fatal_hook.is_some())
            .finish()
    }
}
