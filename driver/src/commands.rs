//! Database commands
//!
//! Commands are queries against `<db>.$cmd` returning a single document
//! with an `ok` field.

use crate::connection::Connection;
use crate::namespace;
use docwire_core::network::update_flags;
use docwire_core::{Bson, DocWireError, DocWireResult};
use tracing::debug;

pub mod index_flags {
	pub const UNIQUE: i32 = 1 << 0;
	pub const DROP_DUPS: i32 = 1 << 2;
	pub const BACKGROUND: i32 = 1 << 3;
	pub const SPARSE: i32 = 1 << 4;
}

const MAX_INDEX_NAME_LEN: usize = 254;

fn hex_digest(data: &[u8]) -> String {
	format!("{:x}", md5::compute(data))
}

/// Stored password digest: `md5("<user>:mongo:<password>")`.
pub fn password_digest(user: &str, password: &str) -> String {
	hex_digest(format!("{}:mongo:{}", user, password).as_bytes())
}

/// Answer to an authentication challenge:
/// `md5(nonce + user + password_digest)`.
pub fn auth_key(nonce: &str, user: &str, password: &str) -> String {
	let digest = password_digest(user, password);
	hex_digest(format!("{}{}{}", nonce, user, digest).as_bytes())
}

/// Index name generated from the key fields: `_` followed by the field
/// names run together.
pub fn index_name(key: &Bson) -> String {
	let mut name = String::from("_");
	for field in key.view().keys() {
		name.push_str(field);
	}
	if name.len() > MAX_INDEX_NAME_LEN {
		let mut end = MAX_INDEX_NAME_LEN;
		while !name.is_char_boundary(end) {
			end -= 1;
		}
		name.truncate(end);
	}
	name
}

impl Connection {
	/// Runs `command` against `db`. A reply whose `ok` is false is
	/// `CommandFailed`.
	pub fn run_command(&mut self, db: &str, command: &Bson) -> DocWireResult<Bson> {
		let result = self.run_command_inner(db, command);
		self.record(result)
	}

	fn run_command_inner(&mut self, db: &str, command: &Bson) -> DocWireResult<Bson> {
		Self::check_query_document(command)?;
		let ns = format!("{}.$cmd", db);
		let response = self
			.find_one(&ns, command, None)?
			.ok_or_else(|| DocWireError::CommandFailed("no response to command".into()))?;

		if response.find("ok").is_some_and(|e| e.as_bool()) {
			return Ok(response);
		}
		let message = response
			.find("errmsg")
			.map(|e| e.as_str().to_string())
			.filter(|m| !m.is_empty())
			.unwrap_or_else(|| "command failed".to_string());
		let code = response.find("code").map_or(0, |e| e.as_i32());
		self.set_server_error(code, &message);
		Err(DocWireError::CommandFailed(message))
	}

	/// Runs `{<name>: <arg>}`.
	pub fn simple_int_command(&mut self, db: &str, name: &str, arg: i32) -> DocWireResult<Bson> {
		let mut cmd = Bson::with_config(self.config().codec.clone());
		cmd.append_int(name, arg)?;
		cmd.finish()?;
		self.run_command(db, &cmd)
	}

	pub fn simple_str_command(&mut self, db: &str, name: &str, arg: &str) -> DocWireResult<Bson> {
		let mut cmd = Bson::with_config(self.config().codec.clone());
		cmd.append_string(name, arg)?;
		cmd.finish()?;
		self.run_command(db, &cmd)
	}

	/// Counts documents in `db.collection`, optionally matching `query`.
	pub fn count(&mut self, db: &str, collection: &str, query: Option<&Bson>) -> DocWireResult<i64> {
		let mut cmd = Bson::new();
		cmd.append_string("count", collection)?;
		if let Some(query) = query.filter(|q| !q.view().is_empty()) {
			cmd.append_document("query", query.raw()?)?;
		}
		cmd.finish()?;
		let out = self.run_command(db, &cmd)?;
		Ok(out.find("n").map_or(0, |e| e.as_i64()))
	}

	pub fn drop_db(&mut self, db: &str) -> DocWireResult<()> {
		self.simple_int_command(db, "dropDatabase", 1).map(|_| ())
	}

	pub fn drop_collection(&mut self, db: &str, collection: &str) -> DocWireResult<Bson> {
		self.simple_str_command(db, "drop", collection)
	}

	/// Creates an index on `ns` by inserting its description into
	/// `<db>.system.indexes`, then confirms with `getlasterror`.
	pub fn create_index(&mut self, ns: &str, key: &Bson, options: i32) -> DocWireResult<Bson> {
		Self::check_query_document(key)?;
		let name = index_name(key);

		let mut spec = Bson::new();
		spec.append_document("key", key.raw()?)?;
		spec.append_string("ns", ns)?;
		spec.append_string("name", &name)?;
		if options & index_flags::UNIQUE != 0 {
			spec.append_bool("unique", true)?;
		}
		if options & index_flags::DROP_DUPS != 0 {
			spec.append_bool("dropDups", true)?;
		}
		if options & index_flags::BACKGROUND != 0 {
			spec.append_bool("background", true)?;
		}
		if options & index_flags::SPARSE != 0 {
			spec.append_bool("sparse", true)?;
		}
		spec.finish()?;

		let db = namespace::database(ns);
		debug!("creating index {} on {}", name, ns);
		self.insert(&format!("{}.system.indexes", db), &spec, None)?;
		self.get_last_error(db)
	}

	/// Ascending index on one field.
	pub fn create_simple_index(&mut self, ns: &str, field: &str, options: i32) -> DocWireResult<Bson> {
		let mut key = Bson::new();
		key.append_int(field, 1)?;
		key.finish()?;
		self.create_index(ns, &key, options)
	}

	/// `size` is in bytes; `max` caps the document count when positive.
	pub fn create_capped_collection(
		&mut self,
		db: &str,
		collection: &str,
		size: i32,
		max: i32,
	) -> DocWireResult<Bson> {
		let mut cmd = Bson::new();
		cmd.append_string("create", collection)?;
		cmd.append_bool("capped", true)?;
		cmd.append_int("size", size)?;
		if max > 0 {
			cmd.append_int("max", max)?;
		}
		cmd.finish()?;
		self.run_command(db, &cmd)
	}

	/// Result of the last write on this socket. A non-null `err` is
	/// recorded on the connection and returned as a server error.
	pub fn get_last_error(&mut self, db: &str) -> DocWireResult<Bson> {
		self.error_helper(db, "getlasterror")
	}

	pub fn get_prev_error(&mut self, db: &str) -> DocWireResult<Bson> {
		self.error_helper(db, "getpreverror")
	}

	fn error_helper(&mut self, db: &str, command: &str) -> DocWireResult<Bson> {
		self.clear_errors();
		let out = self.simple_int_command(db, command, 1)?;
		let result = match self.take_server_error(out.raw()?, "err") {
			Some(err) => Err(DocWireError::Server {
				code: err.code,
				message: err.message,
			}),
			None => Ok(out),
		};
		self.record(result)
	}

	pub fn reset_error(&mut self, db: &str) -> DocWireResult<()> {
		self.simple_int_command(db, "reseterror", 1).map(|_| ())
	}

	/// Whether the connected server reports itself primary.
	pub fn is_master(&mut self) -> DocWireResult<bool> {
		let out = self.simple_int_command("admin", "ismaster", 1)?;
		Ok(out.find("ismaster").is_some_and(|e| e.as_bool()))
	}

	/// Creates or updates a user in `<db>.system.users`.
	pub fn add_user(&mut self, db: &str, user: &str, password: &str) -> DocWireResult<()> {
		let mut selector = Bson::new();
		selector.append_string("user", user)?;
		selector.finish()?;

		let mut update = Bson::new();
		update.begin_object("$set")?;
		update.append_string("pwd", &password_digest(user, password))?;
		update.finish_object()?;
		update.finish()?;

		let ns = format!("{}.system.users", db);
		self.update(&ns, &selector, &update, update_flags::UPSERT, None)
	}

	/// Nonce challenge-response login against `db`.
	pub fn authenticate(&mut self, db: &str, user: &str, password: &str) -> DocWireResult<()> {
		let out = self.simple_int_command(db, "getnonce", 1)?;
		let nonce = out.find("nonce").map(|e| e.as_str().to_string()).unwrap_or_default();

		let mut cmd = Bson::new();
		cmd.append_int("authenticate", 1)?;
		cmd.append_string("user", user)?;
		cmd.append_string("nonce", &nonce)?;
		cmd.append_string("key", &auth_key(&nonce, user, password))?;
		cmd.finish()?;

		match self.run_command(db, &cmd) {
			Ok(_) => {
				debug!("authenticated {} on {}", user, db);
				Ok(())
			}
			Err(DocWireError::CommandFailed(msg)) => {
				let result = Err(DocWireError::AuthFailed(msg));
				self.record(result)
			}
			Err(e) => Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_digests() {
		assert_eq!(
			password_digest("alice", "secret"),
			format!("{:x}", md5::compute(b"alice:mongo:secret"))
		);
		assert_eq!(password_digest("a", "b").len(), 32);

		let expected = format!(
			"{:x}",
			md5::compute(format!("n0nce{}{}", "alice", password_digest("alice", "secret")))
		);
		assert_eq!(auth_key("n0nce", "alice", "secret"), expected);
	}

	#[test]
	fn test_index_name() {
		let mut key = Bson::new();
		key.append_int("files_id", 1).unwrap();
		key.append_int("n", 1).unwrap();
		key.finish().unwrap();
		assert_eq!(index_name(&key), "_files_idn");

		let mut long = Bson::new();
		long.append_int("x".repeat(300), 1).unwrap();
		long.finish().unwrap();
		assert_eq!(index_name(&long).len(), MAX_INDEX_NAME_LEN);
	}
}
