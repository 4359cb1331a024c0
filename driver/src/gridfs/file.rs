use super::{Store, file_flags};
use crate::connection::Connection;
use crate::cursor::Cursor;
use chrono::{DateTime, Utc};
use docwire_core::bson::subtype;
use docwire_core::network::update_flags;
use docwire_core::{Bson, DocWireError, DocWireResult, Oid, RawDoc};
use std::borrow::Cow;
use std::io::Write;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
	Reader,
	Writer,
}

/// A file in a chunked store.
///
/// Readers stream chunks on demand and keep the last one fetched.
/// Writers keep one chunk in memory; it is flushed when writing moves
/// past it, when it fills up, and on `flush` or `close`. The metadata
/// document is only written by `close`.
#[derive(Debug)]
pub struct GridFile {
	store: Store,
	id: Oid,
	filename: String,
	content_type: Option<String>,
	length: u64,
	chunk_size: usize,
	upload_date: i64,
	md5: Option<String>,
	flags: i32,
	mode: FileMode,
	pos: u64,
	pending: Vec<u8>,
	pending_chunk: Option<u64>,
	dirty: bool,
	read_cache: Option<(u64, Vec<u8>)>,
}

impl GridFile {
	pub(crate) fn new_writer(
		store: Store,
		filename: &str,
		content_type: Option<&str>,
		chunk_size: usize,
		flags: i32,
	) -> Self {
		Self {
			store,
			id: Oid::generate(),
			filename: filename.to_string(),
			content_type: content_type.map(str::to_string),
			length: 0,
			chunk_size,
			upload_date: 0,
			md5: None,
			flags,
			mode: FileMode::Writer,
			pos: 0,
			pending: Vec::new(),
			pending_chunk: None,
			dirty: false,
			read_cache: None,
		}
	}

	pub(crate) fn from_document(store: Store, doc: RawDoc<'_>, default_chunk_size: usize) -> Self {
		let chunk_size = doc
			.find("chunkSize")
			.map(|e| e.as_i64())
			.filter(|&cs| cs > 0)
			.map_or(default_chunk_size.max(1), |cs| cs as usize);
		Self {
			store,
			id: doc.find("_id").map(|e| e.as_oid()).unwrap_or_default(),
			filename: doc.find("filename").map(|e| e.as_str().to_string()).unwrap_or_default(),
			content_type: doc.find("contentType").map(|e| e.as_str().to_string()),
			length: doc.find("length").map_or(0, |e| e.as_i64().max(0) as u64),
			chunk_size,
			upload_date: doc.find("uploadDate").map_or(0, |e| e.as_date()),
			md5: doc
				.find("md5")
				.filter(|e| !e.is_null())
				.map(|e| e.as_str().to_string()),
			flags: doc.find("flags").map_or(0, |e| e.as_i32()),
			mode: FileMode::Reader,
			pos: 0,
			pending: Vec::new(),
			pending_chunk: None,
			dirty: false,
			read_cache: None,
		}
	}

	pub(crate) fn into_writer(mut self) -> Self {
		self.mode = FileMode::Writer;
		self.pos = 0;
		self.read_cache = None;
		self
	}

	pub fn id(&self) -> &Oid {
		&self.id
	}

	pub fn filename(&self) -> &str {
		&self.filename
	}

	pub fn content_type(&self) -> Option<&str> {
		self.content_type.as_deref()
	}

	pub fn length(&self) -> u64 {
		self.length
	}

	pub fn chunk_size(&self) -> usize {
		self.chunk_size
	}

	/// Milliseconds since the epoch; 0 until a writer is closed.
	pub fn upload_date(&self) -> i64 {
		self.upload_date
	}

	pub fn upload_date_time(&self) -> Option<DateTime<Utc>> {
		DateTime::from_timestamp_millis(self.upload_date)
	}

	pub fn md5(&self) -> Option<&str> {
		self.md5.as_deref()
	}

	pub fn flags(&self) -> i32 {
		self.flags
	}

	pub fn is_compressed(&self) -> bool {
		self.flags & file_flags::COMPRESSED != 0
	}

	pub fn mode(&self) -> FileMode {
		self.mode
	}

	pub fn position(&self) -> u64 {
		self.pos
	}

	pub fn num_chunks(&self) -> u64 {
		self.length.div_ceil(self.chunk_size as u64)
	}

	/// Moves the read/write position. Readers are clamped to the file
	/// length; writers may seek past it, and the gap is zero-filled on the
	/// next write.
	pub fn seek(&mut self, pos: u64) -> u64 {
		self.pos = match self.mode {
			FileMode::Reader => pos.min(self.length),
			FileMode::Writer => pos,
		};
		self.pos
	}

	/// The metadata document as stored in `<prefix>.files`.
	pub fn metadata(&self) -> DocWireResult<Bson> {
		let mut doc = Bson::new();
		doc.append_oid("_id", &self.id)?;
		doc.append_string("filename", &self.filename)?;
		if let Some(ct) = &self.content_type {
			doc.append_string("contentType", ct)?;
		}
		doc.append_long("length", self.length as i64)?;
		doc.append_int("chunkSize", self.chunk_size as i32)?;
		doc.append_date("uploadDate", self.upload_date)?;
		if let Some(md5) = &self.md5 {
			doc.append_string("md5", md5)?;
		}
		doc.append_int("flags", self.flags)?;
		doc.finish()?;
		Ok(doc)
	}

	fn chunk_selector(&self, n: u64) -> DocWireResult<Bson> {
		let mut sel = Bson::new();
		sel.append_oid("files_id", &self.id)?;
		sel.append_int("n", n as i32)?;
		sel.finish()?;
		Ok(sel)
	}

	fn missing(&self, n: u64) -> DocWireError {
		DocWireError::ChunkMissing {
			files_id: self.id.to_hex(),
			n,
		}
	}

	fn encode_payload<'d>(&self, data: &'d [u8]) -> DocWireResult<Cow<'d, [u8]>> {
		if !self.is_compressed() {
			return Ok(Cow::Borrowed(data));
		}
		match &self.store.filter {
			Some(filter) => Ok(Cow::Owned(filter.encode(data)?)),
			None => Err(DocWireError::InvalidInput(format!(
				"{} is compressed but the store has no filter",
				self.filename
			))),
		}
	}

	/// Payload of a chunk document, passed back through the store's filter
	/// when the file was stored compressed.
	pub fn decode_chunk(&self, chunk: RawDoc<'_>) -> DocWireResult<Vec<u8>> {
		let data = chunk
			.find("data")
			.ok_or_else(|| DocWireError::InvalidDocument("chunk has no data field".into()))?;
		let stored = data.bin_data();
		if !self.is_compressed() {
			return Ok(stored.to_vec());
		}
		match &self.store.filter {
			Some(filter) => filter.decode(stored),
			None => Err(DocWireError::InvalidInput(format!(
				"{} is compressed but the store has no filter",
				self.filename
			))),
		}
	}

	fn fetch_chunk(&self, conn: &mut Connection, n: u64) -> DocWireResult<Option<Vec<u8>>> {
		let sel = self.chunk_selector(n)?;
		match conn.find_one(&self.store.chunks_ns, &sel, None)? {
			Some(doc) => self.decode_chunk(doc.raw()?).map(Some),
			None => Ok(None),
		}
	}

	/// Decoded content of chunk `n`.
	pub fn chunk(&self, conn: &mut Connection, n: u64) -> DocWireResult<Vec<u8>> {
		if n >= self.num_chunks() {
			return Err(DocWireError::InvalidInput(format!(
				"chunk {} out of range for {} chunks",
				n,
				self.num_chunks()
			)));
		}
		self.fetch_chunk(conn, n)?.ok_or_else(|| self.missing(n))
	}

	/// Cursor over up to `count` chunk documents starting at `start`, in
	/// order. A `count` of 0 reads to the end.
	pub fn chunks<'c>(&self, conn: &'c mut Connection, start: u64, count: i32) -> DocWireResult<Cursor<'c>> {
		let mut query = Bson::new();
		query.begin_object("$query")?;
		query.append_oid("files_id", &self.id)?;
		query.begin_object("n")?;
		query.append_int("$gte", start as i32)?;
		query.finish_object()?;
		query.finish_object()?;
		query.begin_object("$orderby")?;
		query.append_int("n", 1)?;
		query.finish_object()?;
		query.finish()?;
		conn.find(&self.store.chunks_ns, &query, None, count, 0, 0)
	}

	fn load_cache(&mut self, conn: &mut Connection, n: u64) -> DocWireResult<()> {
		if matches!(&self.read_cache, Some((cached, _)) if *cached == n) {
			return Ok(());
		}
		let data = self.chunk(conn, n)?;
		self.read_cache = Some((n, data));
		Ok(())
	}

	/// Reads from the current position into `buf`. Returns 0 at the end of
	/// the file.
	pub fn read(&mut self, conn: &mut Connection, buf: &mut [u8]) -> DocWireResult<usize> {
		self.flush(conn)?;
		let cs = self.chunk_size as u64;
		let mut total = 0;
		while total < buf.len() && self.pos < self.length {
			let n = self.pos / cs;
			let offset = (self.pos % cs) as usize;
			self.load_cache(conn, n)?;

			let copied = {
				let data = match &self.read_cache {
					Some((_, data)) => data,
					None => return Err(self.missing(n)),
				};
				if offset >= data.len() {
					return Err(self.missing(n));
				}
				let avail = (data.len() - offset)
					.min((self.length - self.pos) as usize)
					.min(buf.len() - total);
				buf[total..total + avail].copy_from_slice(&data[offset..offset + avail]);
				avail
			};
			total += copied;
			self.pos += copied as u64;
		}
		Ok(total)
	}

	/// Streams the whole file to `out`. Returns the number of bytes written.
	pub fn write_to(&mut self, conn: &mut Connection, out: &mut impl Write) -> DocWireResult<u64> {
		self.flush(conn)?;
		let num_chunks = self.num_chunks();
		if num_chunks == 0 {
			return Ok(0);
		}

		let mut written = 0u64;
		let mut expected = 0u64;
		let mut cursor = self.chunks(conn, 0, 0)?;
		while let Some(doc) = cursor.next()? {
			let n = doc.find("n").map_or(-1, |e| e.as_i64());
			if n != expected as i64 {
				return Err(self.missing(expected));
			}
			let data = self.decode_chunk(doc)?;
			let take = (data.len() as u64).min(self.length - written) as usize;
			out.write_all(&data[..take])?;
			written += take as u64;
			expected += 1;
			if expected == num_chunks {
				break;
			}
		}
		if expected < num_chunks {
			return Err(self.missing(expected));
		}
		Ok(written)
	}

	fn require_writer(&self) -> DocWireResult<()> {
		match self.mode {
			FileMode::Writer => Ok(()),
			FileMode::Reader => Err(DocWireError::InvalidInput(format!(
				"{} is open for reading",
				self.filename
			))),
		}
	}

	/// Writes `data` at the current position, growing the file as needed.
	pub fn write(&mut self, conn: &mut Connection, data: &[u8]) -> DocWireResult<usize> {
		self.require_writer()?;
		if self.pos > self.length {
			let target = self.pos;
			self.expand(conn, target)?;
		}
		self.write_at_pos(conn, data)
	}

	fn write_at_pos(&mut self, conn: &mut Connection, data: &[u8]) -> DocWireResult<usize> {
		let cs = self.chunk_size as u64;
		let mut written = 0;
		while written < data.len() {
			let n = self.pos / cs;
			let offset = (self.pos % cs) as usize;
			self.load_pending(conn, n)?;

			let take = (self.chunk_size - offset).min(data.len() - written);
			let end = offset + take;
			if self.pending.len() < end {
				self.pending.resize(end, 0);
			}
			self.pending[offset..end].copy_from_slice(&data[written..written + take]);
			self.dirty = true;
			written += take;
			self.pos += take as u64;
			self.length = self.length.max(self.pos);

			if end == self.chunk_size {
				self.flush(conn)?;
				self.pending.clear();
				self.pending_chunk = None;
			}
		}
		self.read_cache = None;
		Ok(written)
	}

	fn load_pending(&mut self, conn: &mut Connection, n: u64) -> DocWireResult<()> {
		if self.pending_chunk == Some(n) {
			return Ok(());
		}
		self.flush(conn)?;
		self.pending.clear();

		let start = n * self.chunk_size as u64;
		if start < self.length {
			let mut data = self.fetch_chunk(conn, n)?.ok_or_else(|| self.missing(n))?;
			data.truncate((self.length - start).min(self.chunk_size as u64) as usize);
			self.pending = data;
		}
		self.pending_chunk = Some(n);
		self.dirty = false;
		Ok(())
	}

	/// Upserts the in-memory chunk if it changed.
	pub fn flush(&mut self, conn: &mut Connection) -> DocWireResult<()> {
		if !self.dirty {
			return Ok(());
		}
		let Some(n) = self.pending_chunk else {
			return Ok(());
		};

		let selector = self.chunk_selector(n)?;
		let payload = self.encode_payload(&self.pending)?;
		let mut chunk = Bson::new();
		chunk.append_oid("files_id", &self.id)?;
		chunk.append_int("n", n as i32)?;
		chunk.append_binary("data", subtype::GENERIC, &payload)?;
		chunk.finish()?;

		conn.update(&self.store.chunks_ns, &selector, &chunk, update_flags::UPSERT, None)?;
		debug!("flushed chunk {} of {} ({} bytes)", n, self.filename, self.pending.len());
		self.dirty = false;
		self.read_cache = None;
		Ok(())
	}

	/// Shrinks the file to `new_len`. The chunk holding the new end is cut
	/// down and every chunk after it is removed. Growing is a no-op; use
	/// `expand` or `set_size`.
	pub fn truncate(&mut self, conn: &mut Connection, new_len: u64) -> DocWireResult<u64> {
		self.require_writer()?;
		if new_len >= self.length {
			return Ok(self.length);
		}
		self.flush(conn)?;
		self.pending.clear();
		self.pending_chunk = None;
		self.read_cache = None;

		let cs = self.chunk_size as u64;
		let n = new_len / cs;
		let rem = (new_len % cs) as usize;
		if rem > 0 {
			let mut data = self.fetch_chunk(conn, n)?.ok_or_else(|| self.missing(n))?;
			data.truncate(rem);
			self.pending = data;
			self.pending_chunk = Some(n);
			self.dirty = true;
			self.flush(conn)?;
		}

		let first_removed = if rem > 0 { n + 1 } else { n };
		let mut selector = Bson::new();
		selector.append_oid("files_id", &self.id)?;
		selector.begin_object("n")?;
		selector.append_int("$gte", first_removed as i32)?;
		selector.finish_object()?;
		selector.finish()?;
		conn.remove(&self.store.chunks_ns, &selector, 0, None)?;

		debug!("truncated {} from {} to {} bytes", self.filename, self.length, new_len);
		self.length = new_len;
		self.pos = self.pos.min(new_len);
		Ok(new_len)
	}

	/// Grows the file to `new_len` with zero bytes. The position is kept.
	pub fn expand(&mut self, conn: &mut Connection, new_len: u64) -> DocWireResult<u64> {
		self.require_writer()?;
		if new_len <= self.length {
			return Ok(self.length);
		}
		let saved = self.pos;
		self.pos = self.length;
		let zeros = vec![0u8; self.chunk_size];
		while self.pos < new_len {
			let take = (new_len - self.pos).min(self.chunk_size as u64) as usize;
			self.write_at_pos(conn, &zeros[..take])?;
		}
		self.pos = saved;
		Ok(self.length)
	}

	pub fn set_size(&mut self, conn: &mut Connection, new_len: u64) -> DocWireResult<u64> {
		if new_len < self.length {
			self.truncate(conn, new_len)
		} else {
			self.expand(conn, new_len)
		}
	}

	/// Flushes pending data, then writes the metadata document with the
	/// server's content hash and reopens the file for reading. Closing a
	/// reader does nothing.
	pub fn close(&mut self, conn: &mut Connection) -> DocWireResult<()> {
		if self.mode == FileMode::Reader {
			return Ok(());
		}
		self.flush(conn)?;
		self.pending.clear();
		self.pending_chunk = None;

		self.upload_date = Utc::now().timestamp_millis();
		self.md5 = if self.flags & (file_flags::NO_MD5 | file_flags::COMPRESSED) != 0 {
			None
		} else {
			Some(self.server_md5(conn)?)
		};

		let mut selector = Bson::new();
		selector.append_oid("_id", &self.id)?;
		selector.finish()?;
		let doc = self.metadata()?;
		conn.update(&self.store.files_ns, &selector, &doc, update_flags::UPSERT, None)?;

		debug!("closed {} ({} bytes, {} chunks)", self.filename, self.length, self.num_chunks());
		self.mode = FileMode::Reader;
		self.pos = 0;
		self.read_cache = None;
		Ok(())
	}

	fn server_md5(&self, conn: &mut Connection) -> DocWireResult<String> {
		let mut cmd = Bson::new();
		cmd.append_oid("filemd5", &self.id)?;
		cmd.append_string("root", &self.store.prefix)?;
		cmd.finish()?;
		let out = conn.run_command(&self.store.db, &cmd)?;
		out.find("md5")
			.map(|e| e.as_str().to_string())
			.ok_or_else(|| DocWireError::CommandFailed("filemd5 returned no md5".into()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gridfs::Lz4Filter;
	use std::sync::Arc;

	fn store(filter: bool) -> Store {
		Store {
			db: "test".into(),
			prefix: "fs".into(),
			files_ns: "test.fs.files".into(),
			chunks_ns: "test.fs.chunks".into(),
			filter: if filter { Some(Arc::new(Lz4Filter)) } else { None },
		}
	}

	#[test]
	fn test_metadata_round_trip() {
		let mut file = GridFile::new_writer(store(false), "a.txt", Some("text/plain"), 1024, file_flags::NO_MD5);
		file.length = 3000;
		file.upload_date = 1_700_000_000_000;

		let doc = file.metadata().unwrap();
		let back = GridFile::from_document(store(false), doc.raw().unwrap(), 99);
		assert_eq!(back.id(), file.id());
		assert_eq!(back.filename(), "a.txt");
		assert_eq!(back.content_type(), Some("text/plain"));
		assert_eq!(back.length(), 3000);
		assert_eq!(back.chunk_size(), 1024);
		assert_eq!(back.num_chunks(), 3);
		assert_eq!(back.flags(), file_flags::NO_MD5);
		assert_eq!(back.mode(), FileMode::Reader);
		assert!(back.md5().is_none());
		assert!(back.upload_date_time().is_some());
	}

	#[test]
	fn test_reader_seek_clamps() {
		let mut file = GridFile::new_writer(store(false), "a", None, 16, 0);
		file.length = 40;
		assert_eq!(file.seek(100), 100);
		file.mode = FileMode::Reader;
		assert_eq!(file.seek(100), 40);
	}

	#[test]
	fn test_decode_chunk_through_filter() {
		let file = GridFile::new_writer(store(true), "z", None, 16, file_flags::COMPRESSED);
		let payload = file.encode_payload(b"hello hello hello").unwrap().into_owned();
		let mut chunk = Bson::new();
		chunk.append_binary("data", subtype::GENERIC, &payload).unwrap();
		chunk.finish().unwrap();
		assert_eq!(file.decode_chunk(chunk.raw().unwrap()).unwrap(), b"hello hello hello");

		let mut plain = GridFile::new_writer(store(false), "z", None, 16, file_flags::COMPRESSED);
		plain.id = *file.id();
		assert!(matches!(
			plain.decode_chunk(chunk.raw().unwrap()),
			Err(DocWireError::InvalidInput(_))
		));
	}
}
