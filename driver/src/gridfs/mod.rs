//! Chunked file storage
//!
//! A store is a pair of collections, `<prefix>.files` holding one
//! metadata document per file and `<prefix>.chunks` holding the content
//! split into `{files_id, n, data}` documents of at most `chunkSize`
//! bytes.

mod file;
mod filter;

pub use file::{FileMode, GridFile};
pub use filter::{ChunkFilter, Lz4Filter};

use crate::commands::index_flags;
use crate::connection::Connection;
use docwire_core::{Bson, DocWireError, DocWireResult};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_CHUNK_SIZE: usize = 262_144;
pub const DEFAULT_PREFIX: &str = "fs";

pub mod file_flags {
	/// Skip the server-side content hash at close.
	pub const NO_MD5: i32 = 1 << 0;
	/// Chunks were stored through the store's filter.
	pub const COMPRESSED: i32 = 1 << 1;
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct GridFsConfig {
	pub prefix: String,
	pub chunk_size: usize,
	pub filter: Option<Arc<dyn ChunkFilter>>,
}

impl Default for GridFsConfig {
	fn default() -> Self {
		Self {
			prefix: DEFAULT_PREFIX.to_string(),
			chunk_size: DEFAULT_CHUNK_SIZE,
			filter: None,
		}
	}
}

impl GridFsConfig {
	pub fn with_prefix(mut self, prefix: &str) -> Self {
		self.prefix = prefix.to_string();
		self
	}

	pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
		self.chunk_size = chunk_size;
		self
	}

	pub fn with_filter(mut self, filter: impl ChunkFilter + 'static) -> Self {
		self.filter = Some(Arc::new(filter));
		self
	}
}

/// Names shared by a store and the files opened from it.
#[derive(Debug, Clone)]
pub(crate) struct Store {
	pub(crate) db: String,
	pub(crate) prefix: String,
	pub(crate) files_ns: String,
	pub(crate) chunks_ns: String,
	pub(crate) filter: Option<Arc<dyn ChunkFilter>>,
}

#[derive(Debug, Clone)]
pub struct GridFs {
	store: Store,
	chunk_size: usize,
}

impl GridFs {
	/// Opens the store `<db>.<prefix>`, making sure its indexes exist.
	pub fn open(conn: &mut Connection, db: &str, config: GridFsConfig) -> DocWireResult<Self> {
		if config.chunk_size == 0 {
			return Err(DocWireError::InvalidInput("chunk size must be positive".into()));
		}
		let store = Store {
			db: db.to_string(),
			files_ns: format!("{}.{}.files", db, config.prefix),
			chunks_ns: format!("{}.{}.chunks", db, config.prefix),
			prefix: config.prefix,
			filter: config.filter,
		};

		let mut chunk_key = Bson::new();
		chunk_key.append_int("files_id", 1)?;
		chunk_key.append_int("n", 1)?;
		chunk_key.finish()?;
		conn.create_index(&store.chunks_ns, &chunk_key, index_flags::UNIQUE)?;
		conn.create_simple_index(&store.files_ns, "filename", 0)?;
		debug!("opened file store {}.{}", store.db, store.prefix);

		Ok(Self {
			store,
			chunk_size: config.chunk_size,
		})
	}

	pub fn prefix(&self) -> &str {
		&self.store.prefix
	}

	pub fn files_ns(&self) -> &str {
		&self.store.files_ns
	}

	pub fn chunks_ns(&self) -> &str {
		&self.store.chunks_ns
	}

	pub fn chunk_size(&self) -> usize {
		self.chunk_size
	}

	pub fn filter(&self) -> Option<&Arc<dyn ChunkFilter>> {
		self.store.filter.as_ref()
	}

	/// A new, empty file in write mode. Nothing reaches the server until
	/// a chunk fills up or the file is closed.
	pub fn create_file(&self, filename: &str, content_type: Option<&str>, flags: i32) -> GridFile {
		let flags = if self.store.filter.is_some() {
			flags | file_flags::COMPRESSED
		} else {
			flags
		};
		GridFile::new_writer(
			self.store.clone(),
			filename,
			content_type,
			self.chunk_size,
			flags,
		)
	}

	pub fn store_buffer(
		&self,
		conn: &mut Connection,
		data: &[u8],
		remote_name: &str,
		content_type: Option<&str>,
		flags: i32,
	) -> DocWireResult<GridFile> {
		let mut file = self.create_file(remote_name, content_type, flags);
		file.write(conn, data)?;
		file.close(conn)?;
		info!("stored {} ({} bytes)", remote_name, data.len());
		Ok(file)
	}

	/// Stores a file from disk, named after the path's file name unless
	/// `remote_name` is given.
	pub fn store_file(
		&self,
		conn: &mut Connection,
		path: impl AsRef<Path>,
		remote_name: Option<&str>,
		content_type: Option<&str>,
		flags: i32,
	) -> DocWireResult<GridFile> {
		let path = path.as_ref();
		let name = match remote_name {
			Some(name) => name.to_string(),
			None => path
				.file_name()
				.map(|n| n.to_string_lossy().into_owned())
				.ok_or_else(|| DocWireError::InvalidInput(format!("no file name in {}", path.display())))?,
		};

		let mut source = File::open(path)?;
		let mut file = self.create_file(&name, content_type, flags);
		let mut buf = vec![0u8; self.chunk_size];
		loop {
			let n = source.read(&mut buf)?;
			if n == 0 {
				break;
			}
			file.write(conn, &buf[..n])?;
		}
		file.close(conn)?;
		info!("stored {} from {} ({} bytes)", name, path.display(), file.length());
		Ok(file)
	}

	/// Most recently uploaded file matching `query`.
	pub fn find_query(&self, conn: &mut Connection, query: &Bson) -> DocWireResult<GridFile> {
		let mut wrapped = Bson::new();
		wrapped.append_document("query", query.raw()?)?;
		wrapped.begin_object("orderby")?;
		wrapped.append_int("uploadDate", -1)?;
		wrapped.finish_object()?;
		wrapped.finish()?;

		match conn.find_one(&self.store.files_ns, &wrapped, None)? {
			Some(doc) => Ok(GridFile::from_document(
				self.store.clone(),
				doc.raw()?,
				self.chunk_size,
			)),
			None => Err(DocWireError::FileNotFound(query.view().to_json().to_string())),
		}
	}

	pub fn find_filename(&self, conn: &mut Connection, filename: &str) -> DocWireResult<GridFile> {
		let mut query = Bson::new();
		query.append_string("filename", filename)?;
		query.finish()?;
		self.find_query(conn, &query).map_err(|e| match e {
			DocWireError::FileNotFound(_) => DocWireError::FileNotFound(filename.to_string()),
			other => other,
		})
	}

	/// Reopens the newest file named `filename` for writing. Its id stays
	/// the same; closing it replaces the metadata document.
	pub fn open_for_update(&self, conn: &mut Connection, filename: &str) -> DocWireResult<GridFile> {
		let file = self.find_filename(conn, filename)?;
		Ok(file.into_writer())
	}

	/// Files matching `query` (all files when `None`), ordered by name.
	pub fn list(&self, conn: &mut Connection, query: Option<&Bson>) -> DocWireResult<Vec<GridFile>> {
		let mut wrapped = Bson::new();
		match query {
			Some(q) => wrapped.append_document("query", q.raw()?)?,
			None => {
				wrapped.begin_object("query")?;
				wrapped.finish_object()?;
			}
		}
		wrapped.begin_object("orderby")?;
		wrapped.append_int("filename", 1)?;
		wrapped.finish_object()?;
		wrapped.finish()?;

		let docs = conn
			.find(&self.store.files_ns, &wrapped, None, 0, 0, 0)?
			.collect_all()?;
		docs.iter()
			.map(|doc| {
				Ok(GridFile::from_document(
					self.store.clone(),
					doc.raw()?,
					self.chunk_size,
				))
			})
			.collect()
	}

	/// Removes every file named `filename` with its chunks. Returns how
	/// many files were removed.
	pub fn remove_filename(&self, conn: &mut Connection, filename: &str) -> DocWireResult<usize> {
		let mut query = Bson::new();
		query.append_string("filename", filename)?;
		query.finish()?;
		let mut fields = Bson::new();
		fields.append_int("_id", 1)?;
		fields.finish()?;

		let docs = conn
			.find(&self.store.files_ns, &query, Some(&fields), 0, 0, 0)?
			.collect_all()?;

		let mut removed = 0;
		for doc in &docs {
			let Some(id) = doc.find("_id") else {
				continue;
			};
			let mut file_sel = Bson::new();
			file_sel.append_element(Some("_id"), &id)?;
			file_sel.finish()?;
			conn.remove(&self.store.files_ns, &file_sel, 0, None)?;

			let mut chunk_sel = Bson::new();
			chunk_sel.append_element(Some("files_id"), &id)?;
			chunk_sel.finish()?;
			conn.remove(&self.store.chunks_ns, &chunk_sel, 0, None)?;
			removed += 1;
		}
		debug!("removed {} files named {}", removed, filename);
		Ok(removed)
	}
}
