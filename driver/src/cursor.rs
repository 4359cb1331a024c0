//! Query cursors
//!
//! A cursor sends its query on the first `next`, then walks the reply
//! buffer document by document, asking for more with get-more when it
//! reaches the end of a batch and the server kept a cursor open.

use crate::connection::Connection;
use docwire_core::network::{Reply, Request, reply_flags};
use docwire_core::{Bson, DocWireError, DocWireResult, RawDoc};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
	NotSent,
	QuerySent,
	HasMore,
	Exhausted,
	/// A tailable cursor caught up with the collection; `next` can be
	/// called again later.
	Pending,
	Errored,
}

pub struct Cursor<'c> {
	conn: &'c mut Connection,
	ns: String,
	query: Bson,
	fields: Option<Bson>,
	skip: i32,
	limit: i32,
	options: i32,
	reply: Option<Reply>,
	offset: Option<usize>,
	seen: i32,
	yielded: usize,
	state: CursorState,
}

impl fmt::Debug for Cursor<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Cursor")
			.field("ns", &self.ns)
			.field("state", &self.state)
			.field("cursor_id", &self.cursor_id())
			.field("seen", &self.seen)
			.finish()
	}
}

impl<'c> Cursor<'c> {
	/// A cursor over `ns` matching everything; adjust with the builder
	/// methods before the first `next`.
	pub fn new(conn: &'c mut Connection, ns: &str) -> Self {
		Self {
			conn,
			ns: ns.to_string(),
			query: Bson::empty(),
			fields: None,
			skip: 0,
			limit: 0,
			options: 0,
			reply: None,
			offset: None,
			seen: 0,
			yielded: 0,
			state: CursorState::NotSent,
		}
	}

	pub fn query(mut self, query: Bson) -> Self {
		self.query = query;
		self
	}

	pub fn fields(mut self, fields: Bson) -> Self {
		self.fields = Some(fields);
		self
	}

	pub fn skip(mut self, skip: i32) -> Self {
		self.skip = skip;
		self
	}

	/// Maximum number of documents to yield; 0 means no limit. The limit
	/// holds whatever page size the server uses.
	pub fn limit(mut self, limit: i32) -> Self {
		self.limit = limit;
		self
	}

	/// `query_flags` bits.
	pub fn options(mut self, options: i32) -> Self {
		self.options = options;
		self
	}

	pub fn ns(&self) -> &str {
		&self.ns
	}

	pub fn state(&self) -> CursorState {
		self.state
	}

	/// Documents received from the server so far.
	pub fn seen(&self) -> i32 {
		self.seen
	}

	/// Server cursor id of the current batch, 0 once the server closed it.
	pub fn cursor_id(&self) -> i64 {
		self.reply.as_ref().map_or(0, |r| r.cursor_id())
	}

	/// The document `next` last returned.
	pub fn current(&self) -> Option<RawDoc<'_>> {
		let reply = self.reply.as_ref()?;
		reply.document_at(self.offset?).ok()
	}

	pub fn next(&mut self) -> DocWireResult<Option<RawDoc<'_>>> {
		if self.advance()? {
			Ok(self.current())
		} else {
			Ok(None)
		}
	}

	/// Copies out the remaining documents.
	pub fn collect_all(&mut self) -> DocWireResult<Vec<Bson>> {
		let mut out = Vec::new();
		while let Some(doc) = self.next()? {
			out.push(Bson::from_raw(doc));
		}
		Ok(out)
	}

	fn advance(&mut self) -> DocWireResult<bool> {
		match self.state {
			CursorState::Exhausted => return Ok(false),
			CursorState::Errored => return Err(DocWireError::CursorInvalid),
			CursorState::NotSent => self.send_query()?,
			_ => {}
		}

		if self.limit > 0 && self.yielded >= self.limit as usize {
			self.state = CursorState::Exhausted;
			return Ok(false);
		}

		loop {
			let reply = self.reply.as_ref().ok_or(DocWireError::CursorInvalid)?;
			let next = match self.offset {
				None => Ok(0),
				Some(offset) => reply.document_at(offset).map(|d| offset + d.size()),
			}
			.and_then(|next| {
				if next < reply.objects().len() {
					reply.document_at(next).map(|_| Some(next))
				} else {
					Ok(None)
				}
			});
			let next = match next {
				Ok(next) => next,
				Err(e) => {
					warn!("malformed document in reply batch on {}: {}", self.ns, e);
					self.state = CursorState::Errored;
					return Err(e);
				}
			};
			if let Some(next) = next {
				self.offset = Some(next);
				self.yielded += 1;
				self.state = CursorState::HasMore;
				return Ok(true);
			}

			if reply.cursor_id() == 0 {
				self.state = CursorState::Exhausted;
				return Ok(false);
			}
			self.get_more()?;

			let reply = self.reply.as_ref().ok_or(DocWireError::CursorInvalid)?;
			if reply.objects().is_empty() {
				self.state = if reply.cursor_id() != 0 {
					CursorState::Pending
				} else {
					CursorState::Exhausted
				};
				return Ok(false);
			}
		}
	}

	fn send_query(&mut self) -> DocWireResult<()> {
		self.conn.clear_errors();
		let result = self.op_query();
		if result.is_err() {
			self.state = CursorState::Errored;
		}
		self.conn.record(result)
	}

	fn op_query(&mut self) -> DocWireResult<()> {
		Connection::check_query_document(&self.query)?;
		if let Some(fields) = &self.fields {
			Connection::check_query_document(fields)?;
		}

		let reply = {
			let request = Request::Query {
				flags: self.options,
				ns: &self.ns,
				skip: self.skip,
				limit: self.limit,
				query: self.query.raw()?,
				fields: match &self.fields {
					Some(f) => Some(f.raw()?),
					None => None,
				},
			};
			self.conn.call(&request)?
		};

		let failed = reply.fields.flags & reply_flags::QUERY_FAILURE != 0;
		if reply.number_returned() == 1 || failed {
			if let Some(first) = reply.first() {
				if let Some(err) = self.conn.take_server_error(first, "$err") {
					self.reply = Some(reply);
					return Err(DocWireError::QueryFailed(err.message));
				}
			}
		}
		if failed {
			self.reply = Some(reply);
			return Err(DocWireError::QueryFailed("query failure flag set".into()));
		}

		self.seen += reply.number_returned();
		self.reply = Some(reply);
		self.offset = None;
		self.state = CursorState::QuerySent;
		Ok(())
	}

	fn get_more(&mut self) -> DocWireResult<()> {
		let cursor_id = self.cursor_id();
		let limit = if self.limit > 0 {
			self.limit - self.seen
		} else {
			0
		};

		let result = {
			let request = Request::GetMore {
				ns: &self.ns,
				limit,
				cursor_id,
			};
			self.conn.call(&request)
		};
		let reply = match result {
			Ok(reply) => reply,
			Err(e) => {
				self.state = CursorState::Errored;
				return self.conn.record(Err(e));
			}
		};

		if reply.fields.flags & reply_flags::CURSOR_NOT_FOUND != 0 {
			warn!("server lost cursor {} on {}", cursor_id, self.ns);
			self.state = CursorState::Errored;
			self.reply = Some(reply);
			return self.conn.record(Err(DocWireError::CursorInvalid));
		}

		self.seen += reply.number_returned();
		self.reply = Some(reply);
		self.offset = None;
		Ok(())
	}

	/// Kills the server cursor if one is still open. Dropping the cursor
	/// does the same but cannot report failure.
	pub fn close(mut self) -> DocWireResult<()> {
		self.kill()
	}

	fn kill(&mut self) -> DocWireResult<()> {
		let cursor_id = self.cursor_id();
		self.reply = None;
		self.offset = None;
		self.state = CursorState::Exhausted;
		if cursor_id == 0 {
			return Ok(());
		}
		debug!("killing cursor {} on {}", cursor_id, self.ns);
		self.conn.kill_cursors(&[cursor_id])
	}
}

impl Drop for Cursor<'_> {
	fn drop(&mut self) {
		if let Err(e) = self.kill() {
			debug!("failed to kill cursor on {}: {}", self.ns, e);
		}
	}
}

impl Connection {
	/// Sends a query and returns the cursor over its results.
	pub fn find(
		&mut self,
		ns: &str,
		query: &Bson,
		fields: Option<&Bson>,
		limit: i32,
		skip: i32,
		options: i32,
	) -> DocWireResult<Cursor<'_>> {
		let mut cursor = Cursor::new(self, ns)
			.query(query.clone())
			.skip(skip)
			.limit(limit)
			.options(options);
		if let Some(fields) = fields {
			cursor = cursor.fields(fields.clone());
		}
		cursor.send_query()?;
		Ok(cursor)
	}

	/// First document matching `query`, copied out of the reply.
	pub fn find_one(&mut self, ns: &str, query: &Bson, fields: Option<&Bson>) -> DocWireResult<Option<Bson>> {
		let mut cursor = Cursor::new(self, ns).query(query.clone()).limit(1);
		if let Some(fields) = fields {
			cursor = cursor.fields(fields.clone());
		}
		let doc = cursor.next()?.map(Bson::from_raw);
		Ok(doc)
	}
}
