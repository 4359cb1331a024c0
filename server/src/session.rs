//! Per-connection request handling

use crate::matcher::{self, QuerySpec};
use crate::state::{ServerCursor, ServerState};
use crate::store::{StoreError, UpdateOutcome};
use bytes::Bytes;
use docwire_core::network::{
    MsgHeader, Reply, Request, delete_flags, insert_flags, query_flags, reply_flags,
    update_flags,
};
use docwire_core::{Bson, DocWireError, DocWireResult, Oid, RawDoc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Byte budget for one reply batch; a batch always holds at least one
/// document.
const MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// How many of the first `max_docs` documents fit in one batch.
fn batch_len(docs: &[Bson], max_docs: usize) -> usize {
    let mut bytes = 0;
    let mut count = 0;
    for doc in docs.iter().take(max_docs) {
        bytes += doc.size();
        if count > 0 && bytes > MAX_BATCH_BYTES {
            break;
        }
        count += 1;
    }
    count
}

/// Outcome of the last write on a connection, as `getlasterror`
/// reports it.
#[derive(Debug, Clone, Default)]
pub struct LastError {
    pub err: Option<String>,
    pub code: i32,
    pub n: usize,
    pub updated_existing: Option<bool>,
    pub upserted: Option<Oid>,
}

impl LastError {
    fn failed(e: &StoreError) -> Self {
        Self {
            err: Some(e.to_string()),
            code: e.code(),
            ..Default::default()
        }
    }

    fn updated(outcome: &UpdateOutcome) -> Self {
        Self {
            n: outcome.n,
            updated_existing: Some(outcome.updated_existing),
            upserted: outcome.upserted,
            ..Default::default()
        }
    }
}

/// Documents and cursor id sent back for a query or get-more.
pub(crate) struct Batch {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub docs: Vec<Bson>,
}

impl Batch {
    fn single(doc: Bson) -> Self {
        Self {
            flags: 0,
            cursor_id: 0,
            starting_from: 0,
            docs: vec![doc],
        }
    }

    fn failure(message: &str, code: i32) -> DocWireResult<Self> {
        let mut doc = Bson::new();
        doc.append_string("$err", message)?;
        doc.append_int("code", code)?;
        doc.finish()?;
        Ok(Self {
            flags: reply_flags::QUERY_FAILURE,
            ..Self::single(doc)
        })
    }
}

pub struct Session {
    pub id: u64,
    pub(crate) state: Arc<ServerState>,
    pub(crate) last_error: LastError,
    pub(crate) prev_error: Option<LastError>,
    pub(crate) nonce: Option<String>,
    pub(crate) authenticated: Vec<(String, String)>,
}

impl Session {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::SeqCst),
            state,
            last_error: LastError::default(),
            prev_error: None,
            nonce: None,
            authenticated: Vec::new(),
        }
    }

    /// Handles one message and returns the encoded reply, if the
    /// operation has one.
    pub fn handle(&mut self, header: &MsgHeader, body: &[u8]) -> DocWireResult<Option<Bytes>> {
        let op = header
            .op_code()
            .ok_or_else(|| DocWireError::Protocol(format!("unknown opcode {}", header.op)))?;
        let request = Request::decode(op, body)?;

        let batch = match request {
            Request::Query {
                flags,
                ns,
                skip,
                limit,
                query,
                fields,
            } => Some(self.query(flags, ns, skip, limit, query, fields)?),
            Request::GetMore {
                ns,
                limit,
                cursor_id,
            } => Some(self.get_more(ns, limit, cursor_id)),
            Request::Insert {
                flags,
                ns,
                documents,
            } => {
                self.insert(flags, ns, &documents);
                None
            }
            Request::Update {
                ns,
                flags,
                selector,
                update,
            } => {
                self.update(ns, flags, selector, update);
                None
            }
            Request::Delete {
                ns,
                flags,
                selector,
            } => {
                self.delete(ns, flags, selector);
                None
            }
            Request::KillCursors { cursor_ids } => {
                for id in cursor_ids {
                    if self.state.cursors.remove(&id).is_some() {
                        debug!("session {} killed cursor {}", self.id, id);
                    }
                }
                None
            }
        };

        let Some(batch) = batch else {
            return Ok(None);
        };
        let docs = batch
            .docs
            .iter()
            .map(|d| d.raw())
            .collect::<Result<Vec<RawDoc<'_>>, _>>()?;
        Ok(Some(Reply::encode(
            self.state.next_request_id(),
            header.request_id,
            batch.flags,
            batch.cursor_id,
            batch.starting_from,
            &docs,
        )))
    }

    /// `(db, user)` pairs this connection has authenticated as.
    pub fn authenticated(&self) -> &[(String, String)] {
        &self.authenticated
    }

    fn set_last_error(&mut self, last: LastError) {
        if last.err.is_some() {
            self.prev_error = Some(last.clone());
        }
        self.last_error = last;
    }

    fn insert(&mut self, flags: i32, ns: &str, documents: &[RawDoc<'_>]) {
        let continue_on_error = flags & insert_flags::CONTINUE_ON_ERROR != 0;
        let is_index = ns.ends_with(".system.indexes");
        let mut last = LastError::default();
        for doc in documents {
            let result = if is_index {
                self.state
                    .store
                    .ensure_index(*doc)
                    .and_then(|created| match created {
                        true => self.state.store.insert(ns, *doc),
                        false => Ok(()),
                    })
            } else {
                self.state.store.insert(ns, *doc)
            };
            if let Err(e) = result {
                debug!("insert into {} failed: {}", ns, e);
                last = LastError::failed(&e);
                if !continue_on_error {
                    break;
                }
            }
        }
        self.set_last_error(last);
    }

    fn update(&mut self, ns: &str, flags: i32, selector: RawDoc<'_>, update: RawDoc<'_>) {
        let upsert = flags & update_flags::UPSERT != 0;
        let multi = flags & update_flags::MULTI != 0;
        let last = match self.state.store.update(ns, selector, update, upsert, multi) {
            Ok(outcome) => LastError::updated(&outcome),
            Err(e) => {
                debug!("update on {} failed: {}", ns, e);
                LastError::failed(&e)
            }
        };
        self.set_last_error(last);
    }

    fn delete(&mut self, ns: &str, flags: i32, selector: RawDoc<'_>) {
        let single = flags & delete_flags::SINGLE_REMOVE != 0;
        let last = match self.state.store.remove(ns, selector, single) {
            Ok(n) => LastError {
                n,
                ..Default::default()
            },
            Err(e) => LastError::failed(&e),
        };
        self.set_last_error(last);
    }

    fn query(
        &mut self,
        flags: i32,
        ns: &str,
        skip: i32,
        limit: i32,
        query: RawDoc<'_>,
        fields: Option<RawDoc<'_>>,
    ) -> DocWireResult<Batch> {
        if let Some(db) = ns.strip_suffix(".$cmd") {
            let reply = self.run_command(db, query)?;
            return Ok(Batch::single(reply));
        }

        if flags & query_flags::TAILABLE != 0 {
            return self.tailable_query(ns, limit, query);
        }

        let mut docs = match self.state.store.find(ns, query) {
            Ok(docs) => docs,
            Err(e) => return Batch::failure(&e.to_string(), e.code()),
        };
        let skip = usize::try_from(skip).unwrap_or(0);
        docs.drain(..skip.min(docs.len()));
        if let Some(fields) = fields.filter(|f| !f.is_empty()) {
            docs = docs
                .iter()
                .map(|d| matcher::project(d.view(), fields))
                .collect::<Result<_, _>>()?;
        }

        // 1 and negative limits ask for a single batch.
        let single_batch = limit < 0 || limit == 1;
        let hard_limit = match limit {
            0 => None,
            n => Some(n.unsigned_abs() as usize),
        };
        if let Some(hard) = hard_limit {
            docs.truncate(hard);
        }
        let batch_size = self.state.config().batch_size.max(1);
        let first = match hard_limit {
            Some(hard) if single_batch => hard,
            Some(hard) => hard.min(batch_size),
            None => batch_size,
        };
        let first = batch_len(&docs, first);

        if docs.len() <= first || single_batch {
            docs.truncate(first);
            return Ok(Batch {
                flags: 0,
                cursor_id: 0,
                starting_from: 0,
                docs,
            });
        }

        let rest = docs.split_off(first);
        let remaining = hard_limit.map(|h| h - first);
        let cursor_id = self.state.open_cursor(ServerCursor::Snapshot {
            ns: ns.to_string(),
            docs: rest,
            pos: 0,
            base: first,
            remaining,
        });
        debug!("session {} opened cursor {} on {}", self.id, cursor_id, ns);
        Ok(Batch {
            flags: 0,
            cursor_id,
            starting_from: 0,
            docs,
        })
    }

    fn tailable_query(&mut self, ns: &str, limit: i32, query: RawDoc<'_>) -> DocWireResult<Batch> {
        let spec = QuerySpec::parse(query);
        let batch_size = self.batch_size(limit);
        let (docs, last_seq) = match self.state.store.find_after(ns, spec.filter, 0, batch_size) {
            Ok(found) => found,
            Err(e) => return Batch::failure(&e.to_string(), e.code()),
        };
        let cursor_id = self.state.open_cursor(ServerCursor::Tailable {
            ns: ns.to_string(),
            filter: Bson::from_raw(spec.filter),
            last_seq,
        });
        Ok(Batch {
            flags: 0,
            cursor_id,
            starting_from: 0,
            docs,
        })
    }

    fn batch_size(&self, limit: i32) -> usize {
        let configured = self.state.config().batch_size.max(1);
        match limit {
            n if n > 0 => configured.min(n as usize),
            _ => configured,
        }
    }

    fn get_more(&mut self, ns: &str, limit: i32, cursor_id: i64) -> Batch {
        let batch_size = self.batch_size(limit);
        let Some(mut entry) = self.state.cursors.get_mut(&cursor_id) else {
            warn!("session {} asked for unknown cursor {}", self.id, cursor_id);
            return Batch {
                flags: reply_flags::CURSOR_NOT_FOUND,
                cursor_id: 0,
                starting_from: 0,
                docs: Vec::new(),
            };
        };

        let (docs, starting_from, exhausted) = match &mut *entry {
            ServerCursor::Snapshot {
                ns: cursor_ns,
                docs,
                pos,
                base,
                remaining,
            } => {
                if cursor_ns != ns {
                    warn!("cursor {} belongs to {}, not {}", cursor_id, cursor_ns, ns);
                }
                let mut take = batch_size.min(docs.len() - *pos);
                if let Some(left) = remaining {
                    take = take.min(*left);
                }
                let take = batch_len(&docs[*pos..], take);
                if let Some(left) = remaining {
                    *left -= take;
                }
                let start = *pos;
                let out = docs[start..start + take].to_vec();
                *pos += take;
                let done = *pos >= docs.len() || remaining.is_some_and(|left| left == 0);
                (out, (*base + start) as i32, done)
            }
            ServerCursor::Tailable {
                ns: cursor_ns,
                filter,
                last_seq,
            } => {
                let found = self
                    .state
                    .store
                    .find_after(cursor_ns, filter.view(), *last_seq, batch_size);
                match found {
                    Ok((out, seq)) => {
                        *last_seq = seq;
                        (out, 0, false)
                    }
                    Err(e) => {
                        warn!("tailable cursor {} failed: {}", cursor_id, e);
                        (Vec::new(), 0, true)
                    }
                }
            }
        };
        drop(entry);

        let cursor_id = if exhausted {
            self.state.cursors.remove(&cursor_id);
            0
        } else {
            cursor_id
        };
        Batch {
            flags: 0,
            cursor_id,
            starting_from,
            docs,
        }
    }
}
