//! Client connection
//!
//! One socket, one request in flight. A connection is either
//! disconnected, connected to a server that is not primary (queries
//! still work, writes are refused), or connected to the primary.

use crate::config::ConnectionConfig;
use crate::host::HostPort;
use crate::namespace;
use crate::write_concern::WriteConcern;
use docwire_core::network::{NetworkConnection, Reply, Request, insert_flags};
use docwire_core::{Bson, BsonType, DocWireError, DocWireResult, RawDoc, ValidityFlags};
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	NonPrimary,
	Primary,
}

/// Error reported by the server for the last operation that failed
/// there: `$err`/`err` text and its code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
	pub code: i32,
	pub message: String,
}

#[derive(Debug, Clone)]
struct ReplicaSet {
	name: String,
	seeds: Vec<HostPort>,
	hosts: Vec<HostPort>,
}

#[derive(Debug, Clone)]
enum Target {
	None,
	Tcp(HostPort),
	#[cfg(unix)]
	Unix(PathBuf),
	ReplicaSet(ReplicaSet),
}

pub struct Connection {
	config: ConnectionConfig,
	stream: Option<NetworkConnection>,
	state: ConnectionState,
	target: Target,
	primary: Option<HostPort>,
	max_bson_size: usize,
	write_concern: Option<WriteConcern>,
	last_error: Option<String>,
	server_error: Option<ServerError>,
	next_request_id: i32,
}

impl Default for Connection {
	fn default() -> Self {
		Self::new()
	}
}

impl Connection {
	pub fn new() -> Self {
		Self::with_config(ConnectionConfig::default())
	}

	pub fn with_config(config: ConnectionConfig) -> Self {
		let max_bson_size = config.default_max_bson_size;
		Self {
			config,
			stream: None,
			state: ConnectionState::Disconnected,
			target: Target::None,
			primary: None,
			max_bson_size,
			write_concern: None,
			last_error: None,
			server_error: None,
			next_request_id: rand::random::<u16>() as i32,
		}
	}

	/// Connects to `host:port` and opens the connection in one step.
	pub fn open(address: &str) -> DocWireResult<Self> {
		let hp = HostPort::parse(address)?;
		let mut conn = Self::new();
		conn.connect(&hp.host, hp.port)?;
		Ok(conn)
	}

	/// Connects to a single server and checks that it is primary. A
	/// reachable server that is not primary leaves the connection open
	/// in the `NonPrimary` state and reports `NotPrimary`.
	pub fn connect(&mut self, host: &str, port: u16) -> DocWireResult<()> {
		let hp = HostPort::new(host, port);
		self.target = Target::Tcp(hp.clone());
		let result = self.connect_single(hp);
		self.record(result)
	}

	#[cfg(unix)]
	pub fn connect_unix(&mut self, path: impl AsRef<Path>) -> DocWireResult<()> {
		let path = path.as_ref().to_path_buf();
		self.target = Target::Unix(path.clone());
		let result = self.connect_unix_path(&path);
		self.record(result)
	}

	/// Starts describing a replica set. Add seeds, then call
	/// `connect_replica_set`.
	pub fn replica_set(&mut self, name: &str) {
		self.target = Target::ReplicaSet(ReplicaSet {
			name: name.to_string(),
			seeds: Vec::new(),
			hosts: Vec::new(),
		});
	}

	pub fn add_seed(&mut self, host: &str, port: u16) {
		if let Target::ReplicaSet(set) = &mut self.target {
			set.seeds.push(HostPort::new(host, port));
		} else {
			warn!("ignoring seed {}:{}, no replica set configured", host, port);
		}
	}

	/// Asks the seeds, in order, for the member list, then walks the
	/// members until one answers as primary.
	pub fn connect_replica_set(&mut self) -> DocWireResult<()> {
		let result = self.discover_primary();
		self.record(result)
	}

	pub fn reconnect(&mut self) -> DocWireResult<()> {
		self.disconnect();
		let result = match self.target.clone() {
			Target::None => Err(DocWireError::NotConnected),
			Target::Tcp(hp) => self.connect_single(hp),
			#[cfg(unix)]
			Target::Unix(path) => self.connect_unix_path(&path),
			Target::ReplicaSet(_) => self.discover_primary(),
		};
		self.record(result)
	}

	/// Pings the server.
	pub fn check_connection(&mut self) -> DocWireResult<()> {
		if self.stream.is_none() {
			return Err(DocWireError::NotConnected);
		}
		self.simple_int_command("admin", "ping", 1).map(|_| ())
	}

	pub fn disconnect(&mut self) {
		if let Target::ReplicaSet(set) = &mut self.target {
			set.hosts.clear();
		}
		self.close_socket();
	}

	pub fn set_op_timeout(&mut self, timeout: Option<Duration>) -> DocWireResult<()> {
		self.config.op_timeout = timeout;
		if let Some(stream) = &self.stream {
			stream.set_timeout(timeout)?;
		}
		Ok(())
	}

	pub fn op_timeout(&self) -> Option<Duration> {
		self.config.op_timeout
	}

	pub fn config(&self) -> &ConnectionConfig {
		&self.config
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	pub fn is_connected(&self) -> bool {
		self.stream.is_some()
	}

	pub fn primary(&self) -> Option<&HostPort> {
		self.primary.as_ref()
	}

	/// Replica set members learned from the seeds.
	pub fn hosts(&self) -> &[HostPort] {
		match &self.target {
			Target::ReplicaSet(set) => &set.hosts,
			_ => &[],
		}
	}

	pub fn max_bson_size(&self) -> usize {
		self.max_bson_size
	}

	/// Default write concern for writes that do not pass their own.
	pub fn set_write_concern(&mut self, write_concern: Option<WriteConcern>) {
		self.write_concern = write_concern;
	}

	pub fn write_concern(&self) -> Option<&WriteConcern> {
		self.write_concern.as_ref()
	}

	/// Message of the last error any operation on this connection
	/// returned.
	pub fn last_error(&self) -> Option<&str> {
		self.last_error.as_deref()
	}

	pub fn server_error(&self) -> Option<&ServerError> {
		self.server_error.as_ref()
	}

	pub fn clear_errors(&mut self) {
		self.last_error = None;
		self.server_error = None;
	}

	pub(crate) fn set_server_error(&mut self, code: i32, message: &str) {
		self.server_error = Some(ServerError {
			code,
			message: message.to_string(),
		});
	}

	/// Records the server error carried by `doc` under `field`, if any.
	pub(crate) fn take_server_error(&mut self, doc: RawDoc<'_>, field: &str) -> Option<ServerError> {
		let elem = doc.find(field)?;
		if elem.kind() != BsonType::String {
			return None;
		}
		let code = doc.find("code").map(|c| c.as_i32()).unwrap_or(0);
		self.set_server_error(code, elem.as_str());
		self.server_error.clone()
	}

	pub(crate) fn record<T>(&mut self, result: DocWireResult<T>) -> DocWireResult<T> {
		if let Err(e) = &result {
			self.last_error = Some(e.to_string());
		}
		result
	}

	// Transport

	pub(crate) fn next_request_id(&mut self) -> i32 {
		self.next_request_id = self.next_request_id.wrapping_add(1);
		self.next_request_id
	}

	fn close_socket(&mut self) {
		if let Some(mut stream) = self.stream.take() {
			stream.shutdown();
		}
		self.state = ConnectionState::Disconnected;
		self.primary = None;
	}

	/// Drops the socket on transport failures so later calls fail fast
	/// with `NotConnected`.
	fn on_transport<T>(&mut self, result: DocWireResult<T>) -> DocWireResult<T> {
		if let Err(e) = &result {
			if e.is_transport() {
				warn!("transport failure, dropping connection: {}", e);
				self.close_socket();
			}
		}
		result
	}

	pub(crate) fn send_message(&mut self, message: &[u8]) -> DocWireResult<()> {
		let stream = self.stream.as_mut().ok_or(DocWireError::NotConnected)?;
		let result = stream.send(message);
		self.on_transport(result)
	}

	/// Sends a request and reads the reply answering it.
	pub(crate) fn call(&mut self, request: &Request<'_>) -> DocWireResult<Reply> {
		let request_id = self.next_request_id();
		let message = request.encode(request_id);
		self.send_message(&message)?;

		let stream = self.stream.as_mut().ok_or(DocWireError::NotConnected)?;
		let result = stream.read_reply().and_then(|reply| {
			if reply.header.response_to != request_id {
				Err(DocWireError::Protocol(format!(
					"reply answers request {} instead of {}",
					reply.header.response_to, request_id
				)))
			} else {
				Ok(reply)
			}
		});
		self.on_transport(result)
	}

	fn open_socket(&mut self, hp: &HostPort) -> DocWireResult<()> {
		self.close_socket();
		let stream = NetworkConnection::connect_tcp(&hp.host, hp.port, self.config.connect_timeout)?;
		stream.set_timeout(self.config.op_timeout)?;
		self.stream = Some(stream);
		self.state = ConnectionState::NonPrimary;
		Ok(())
	}

	fn connect_single(&mut self, hp: HostPort) -> DocWireResult<()> {
		self.open_socket(&hp)?;
		if self.check_is_master()? {
			info!("connected to primary {}", hp);
			self.state = ConnectionState::Primary;
			self.primary = Some(hp);
			Ok(())
		} else {
			Err(DocWireError::NotPrimary(hp.to_string()))
		}
	}

	#[cfg(unix)]
	fn connect_unix_path(&mut self, path: &Path) -> DocWireResult<()> {
		self.close_socket();
		let stream = NetworkConnection::connect_unix(path)?;
		stream.set_timeout(self.config.op_timeout)?;
		self.stream = Some(stream);
		self.state = ConnectionState::NonPrimary;
		if self.check_is_master()? {
			info!("connected to primary at {}", path.display());
			self.state = ConnectionState::Primary;
			Ok(())
		} else {
			Err(DocWireError::NotPrimary(path.display().to_string()))
		}
	}

	/// Runs `ismaster`, adopting the server's size limit.
	fn check_is_master(&mut self) -> DocWireResult<bool> {
		let out = self.simple_int_command("admin", "ismaster", 1)?;
		self.max_bson_size = match out.find("maxBsonObjectSize") {
			Some(e) if e.as_i32() > 0 => e.as_i32() as usize,
			_ => self.config.default_max_bson_size,
		};
		Ok(out.find("ismaster").is_some_and(|e| e.as_bool()))
	}

	fn discover_primary(&mut self) -> DocWireResult<()> {
		let (name, seeds) = match &mut self.target {
			Target::ReplicaSet(set) => {
				set.hosts.clear();
				(set.name.clone(), set.seeds.clone())
			}
			_ => {
				return Err(DocWireError::InvalidInput(
					"no replica set configured".into(),
				));
			}
		};
		self.close_socket();

		let mut hosts = Vec::new();
		for seed in &seeds {
			if let Err(e) = self.open_socket(seed) {
				debug!("seed {} unreachable: {}", seed, e);
				continue;
			}
			hosts = self.seed_hosts();
			self.close_socket();
			if !hosts.is_empty() {
				debug!("seed {} listed {} hosts", seed, hosts.len());
				break;
			}
		}
		if let Target::ReplicaSet(set) = &mut self.target {
			set.hosts = hosts.clone();
		}
		if hosts.is_empty() {
			return Err(DocWireError::NoPrimary(name));
		}

		for host in &hosts {
			if let Err(e) = self.open_socket(host) {
				debug!("host {} unreachable: {}", host, e);
				continue;
			}
			let out = match self.simple_int_command("admin", "ismaster", 1) {
				Ok(out) => out,
				Err(e) => {
					debug!("host {} did not answer ismaster: {}", host, e);
					self.close_socket();
					continue;
				}
			};
			self.max_bson_size = match out.find("maxBsonObjectSize") {
				Some(e) if e.as_i32() > 0 => e.as_i32() as usize,
				_ => self.config.default_max_bson_size,
			};
			if let Some(set_name) = out.find("setName") {
				if set_name.as_str() != name {
					let found = set_name.as_str().to_string();
					self.close_socket();
					return Err(DocWireError::BadSetName {
						expected: name,
						found,
					});
				}
			}
			if out.find("ismaster").is_some_and(|e| e.as_bool()) {
				info!("replica set {} primary is {}", name, host);
				self.state = ConnectionState::Primary;
				self.primary = Some(host.clone());
				return Ok(());
			}
			self.close_socket();
		}

		Err(DocWireError::NoPrimary(name))
	}

	fn seed_hosts(&mut self) -> Vec<HostPort> {
		let Ok(out) = self.simple_int_command("admin", "ismaster", 1) else {
			return Vec::new();
		};
		let Some(list) = out.find("hosts") else {
			return Vec::new();
		};
		list.as_document()
			.iter()
			.filter_map(|e| match HostPort::parse(e.as_str()) {
				Ok(hp) => Some(hp),
				Err(err) => {
					warn!("skipping replica set member '{}': {}", e.as_str(), err);
					None
				}
			})
			.collect()
	}

	// Validity

	/// Documents sent as write payloads: finished, within the size limit,
	/// valid UTF-8, and for `strict_names` free of dotted or
	/// `$`-prefixed field names.
	pub(crate) fn check_write_document(&self, doc: &Bson, strict_names: bool) -> DocWireResult<()> {
		if !doc.is_finished() {
			return Err(DocWireError::NotFinished);
		}
		if doc.size() > self.max_bson_size {
			return Err(DocWireError::TooLarge {
				size: doc.size(),
				max: self.max_bson_size,
			});
		}
		if doc.flags().contains(ValidityFlags::NOT_UTF8) {
			return Err(DocWireError::InvalidDocument("invalid UTF-8".into()));
		}
		if strict_names
			&& doc
				.flags()
				.intersects(ValidityFlags::FIELD_HAS_DOT | ValidityFlags::FIELD_INIT_DOLLAR)
		{
			return Err(DocWireError::InvalidDocument(
				"field names may not contain '.' or start with '$'".into(),
			));
		}
		Ok(())
	}

	/// Query and command documents only need to be finished and valid
	/// UTF-8.
	pub(crate) fn check_query_document(doc: &Bson) -> DocWireResult<()> {
		if !doc.is_finished() {
			return Err(DocWireError::NotFinished);
		}
		if doc.flags().contains(ValidityFlags::NOT_UTF8) {
			return Err(DocWireError::InvalidDocument("invalid UTF-8".into()));
		}
		Ok(())
	}

	fn require_primary(&self) -> DocWireResult<()> {
		match self.state {
			ConnectionState::Primary => Ok(()),
			ConnectionState::NonPrimary => Err(DocWireError::NotPrimary(
				self.primary
					.as_ref()
					.map(|hp| hp.to_string())
					.unwrap_or_else(|| "current server".into()),
			)),
			ConnectionState::Disconnected => Err(DocWireError::NotConnected),
		}
	}

	// Writes

	/// Inserts one document. Fire-and-forget unless a write concern
	/// applies, see [`WriteConcern`].
	pub fn insert(&mut self, ns: &str, doc: &Bson, write_concern: Option<&WriteConcern>) -> DocWireResult<()> {
		let result = self.insert_docs(ns, std::slice::from_ref(doc), write_concern, 0);
		self.record(result)
	}

	/// Inserts several documents in one message. With
	/// `insert_flags::CONTINUE_ON_ERROR` the server keeps going past a
	/// failing document.
	pub fn insert_batch(
		&mut self,
		ns: &str,
		docs: &[Bson],
		write_concern: Option<&WriteConcern>,
		flags: i32,
	) -> DocWireResult<()> {
		let result = self.insert_docs(ns, docs, write_concern, flags);
		self.record(result)
	}

	fn insert_docs(
		&mut self,
		ns: &str,
		docs: &[Bson],
		write_concern: Option<&WriteConcern>,
		flags: i32,
	) -> DocWireResult<()> {
		namespace::validate(ns)?;
		let mut total = 0;
		for doc in docs {
			self.check_write_document(doc, true)?;
			total += doc.size();
		}
		if total > self.max_bson_size {
			return Err(DocWireError::TooLarge {
				size: total,
				max: self.max_bson_size,
			});
		}
		self.require_primary()?;

		let documents = docs
			.iter()
			.map(|d| d.raw())
			.collect::<Result<Vec<_>, _>>()?;
		let request = Request::Insert {
			flags: flags & insert_flags::CONTINUE_ON_ERROR,
			ns,
			documents,
		};
		self.send_write(ns, &request, write_concern)
	}

	/// Updates documents matching `selector`. Replacement documents get
	/// the same field-name checks as inserts; operator documents (first
	/// key starting with `$`) only the basic ones.
	pub fn update(
		&mut self,
		ns: &str,
		selector: &Bson,
		update: &Bson,
		flags: i32,
		write_concern: Option<&WriteConcern>,
	) -> DocWireResult<()> {
		let result = self.update_docs(ns, selector, update, flags, write_concern);
		self.record(result)
	}

	fn update_docs(
		&mut self,
		ns: &str,
		selector: &Bson,
		update: &Bson,
		flags: i32,
		write_concern: Option<&WriteConcern>,
	) -> DocWireResult<()> {
		Self::check_query_document(selector)?;
		let is_operator = update
			.view()
			.iter()
			.next()
			.is_some_and(|e| e.key().starts_with('$'));
		self.check_write_document(update, !is_operator)?;
		self.require_primary()?;

		let request = Request::Update {
			ns,
			flags,
			selector: selector.raw()?,
			update: update.raw()?,
		};
		self.send_write(ns, &request, write_concern)
	}

	/// Removes documents matching `selector`; `delete_flags::SINGLE_REMOVE`
	/// stops after the first.
	pub fn remove(
		&mut self,
		ns: &str,
		selector: &Bson,
		flags: i32,
		write_concern: Option<&WriteConcern>,
	) -> DocWireResult<()> {
		let result = self.remove_docs(ns, selector, flags, write_concern);
		self.record(result)
	}

	fn remove_docs(
		&mut self,
		ns: &str,
		selector: &Bson,
		flags: i32,
		write_concern: Option<&WriteConcern>,
	) -> DocWireResult<()> {
		self.check_write_document(selector, false)?;
		self.require_primary()?;
		let request = Request::Delete {
			ns,
			flags,
			selector: selector.raw()?,
		};
		self.send_write(ns, &request, write_concern)
	}

	fn send_write(
		&mut self,
		ns: &str,
		request: &Request<'_>,
		write_concern: Option<&WriteConcern>,
	) -> DocWireResult<()> {
		let write_concern = write_concern.or(self.write_concern.as_ref()).cloned();
		let request_id = self.next_request_id();
		let message = request.encode(request_id);
		self.send_message(&message)?;
		match write_concern {
			Some(wc) => self.check_last_error(ns, &wc),
			None => Ok(()),
		}
	}

	fn check_last_error(&mut self, ns: &str, write_concern: &WriteConcern) -> DocWireResult<()> {
		let cmd = write_concern.command()?;
		let response = self
			.find_one(&namespace::command_ns(ns), &cmd, None)?
			.ok_or_else(|| DocWireError::CommandFailed("getlasterror returned nothing".into()))?;
		let raw = response.raw()?;
		let err = self
			.take_server_error(raw, "$err")
			.or_else(|| self.take_server_error(raw, "err"));
		match err {
			Some(err) => Err(DocWireError::Server {
				code: err.code,
				message: err.message,
			}),
			None => Ok(()),
		}
	}

	pub(crate) fn kill_cursors(&mut self, cursor_ids: &[i64]) -> DocWireResult<()> {
		let request = Request::KillCursors {
			cursor_ids: cursor_ids.to_vec(),
		};
		let request_id = self.next_request_id();
		let message = request.encode(request_id);
		self.send_message(&message)
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.close_socket();
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("state", &self.state)
			.field("primary", &self.primary)
			.field("max_bson_size", &self.max_bson_size)
			.field("last_error", &self.last_error)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use docwire_core::network::{HEADER_LEN, MsgHeader, OpCode};
	use std::io::{Read, Write};
	use std::net::{TcpListener, TcpStream};
	use std::thread;

	fn ismaster_reply(socket: &mut TcpStream, ismaster: bool) {
		let mut header = [0u8; HEADER_LEN];
		socket.read_exact(&mut header).unwrap();
		let header = MsgHeader::decode(&header).unwrap();
		let mut body = vec![0u8; header.len as usize - HEADER_LEN];
		socket.read_exact(&mut body).unwrap();
		assert_eq!(header.op_code(), Some(OpCode::Query));

		let mut doc = Bson::new();
		doc.append_bool("ismaster", ismaster).unwrap();
		doc.append_int("maxBsonObjectSize", 1024).unwrap();
		doc.append_double("ok", 1.0).unwrap();
		doc.finish().unwrap();
		let reply = Reply::encode(1, header.request_id, 0, 0, 0, &[doc.raw().unwrap()]);
		socket.write_all(&reply).unwrap();
	}

	fn serve_once(ismaster: bool) -> u16 {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		thread::spawn(move || {
			let (mut socket, _) = listener.accept().unwrap();
			ismaster_reply(&mut socket, ismaster);
			let mut rest = Vec::new();
			let _ = socket.read_to_end(&mut rest);
		});
		port
	}

	fn doc_with_key(key: &str) -> Bson {
		let mut doc = Bson::new();
		doc.append_int(key, 1).unwrap();
		doc.finish().unwrap();
		doc
	}

	#[test]
	fn test_not_primary_is_server_error() {
		let port = serve_once(false);
		let mut conn = Connection::new();
		let err = conn.connect("127.0.0.1", port).unwrap_err();
		assert!(matches!(err, DocWireError::NotPrimary(_)));
		assert!(!err.is_transport());
		assert_eq!(conn.state(), ConnectionState::NonPrimary);
		assert!(conn.is_connected());
		assert_eq!(conn.max_bson_size(), 1024);
		assert!(conn.last_error().is_some());

		let err = conn
			.insert("test.c", &doc_with_key("a"), None)
			.unwrap_err();
		assert!(matches!(err, DocWireError::NotPrimary(_)));
	}

	#[test]
	fn test_write_validity() {
		let port = serve_once(true);
		let mut conn = Connection::new();
		conn.connect("127.0.0.1", port).unwrap();
		assert_eq!(conn.state(), ConnectionState::Primary);

		let mut open = Bson::new();
		open.append_int("a", 1).unwrap();
		assert!(matches!(
			conn.insert("test.c", &open, None),
			Err(DocWireError::NotFinished)
		));

		assert!(matches!(
			conn.insert("test.c", &doc_with_key("a.b"), None),
			Err(DocWireError::InvalidDocument(_))
		));
		assert!(matches!(
			conn.insert("test.c", &doc_with_key("$set"), None),
			Err(DocWireError::InvalidDocument(_))
		));
		assert!(matches!(
			conn.insert("bad ns.c", &doc_with_key("a"), None),
			Err(DocWireError::InvalidNamespace(_))
		));

		let mut big = Bson::new();
		big.append_binary("blob", 0, &[0u8; 2048]).unwrap();
		big.finish().unwrap();
		assert!(matches!(
			conn.insert("test.c", &big, None),
			Err(DocWireError::TooLarge { max: 1024, .. })
		));

		let mut bad = Bson::new();
		assert!(bad.append_string_bytes("s", &[0xff, 0xfe]).is_err());
		assert!(bad.finish().is_err());
		assert!(matches!(
			conn.remove("test.c", &bad, 0, None),
			Err(DocWireError::NotFinished)
		));

		conn.clear_errors();
		assert!(conn.last_error().is_none());
	}

	#[test]
	fn test_disconnected_calls_fail_fast() {
		let mut conn = Connection::new();
		assert!(matches!(
			conn.insert("test.c", &doc_with_key("a"), None),
			Err(DocWireError::NotConnected)
		));
		assert!(matches!(
			conn.check_connection(),
			Err(DocWireError::NotConnected)
		));
		assert!(matches!(conn.reconnect(), Err(DocWireError::NotConnected)));
	}
}
