//! Acknowledged writes
//!
//! Without a write concern, inserts, updates and removes are sent and
//! forgotten: the call returns once the bytes are on the socket, and a
//! write the server rejects is indistinguishable from one it applied.
//! With one, a `getlasterror` command built from these settings follows
//! every write on the same socket and its answer decides the result.

use docwire_core::{Bson, DocWireResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteConcern {
	/// Number of servers that must acknowledge; 0 leaves it to the server.
	pub w: i32,
	/// Named mode such as `majority`; takes precedence over `w`.
	pub mode: Option<String>,
	pub wtimeout_ms: i32,
	pub journal: bool,
	pub fsync: bool,
}

impl WriteConcern {
	/// Plain acknowledgement by the primary.
	pub fn acknowledged() -> Self {
		Self {
			w: 1,
			..Self::default()
		}
	}

	pub fn command(&self) -> DocWireResult<Bson> {
		let mut cmd = Bson::new();
		cmd.append_int("getlasterror", 1)?;
		if let Some(mode) = &self.mode {
			cmd.append_string("w", mode)?;
		} else if self.w != 0 {
			cmd.append_int("w", self.w)?;
		}
		if self.wtimeout_ms != 0 {
			cmd.append_int("wtimeout", self.wtimeout_ms)?;
		}
		if self.journal {
			cmd.append_int("j", 1)?;
		}
		if self.fsync {
			cmd.append_int("fsync", 1)?;
		}
		cmd.finish()?;
		Ok(cmd)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_command_fields() {
		let cmd = WriteConcern::acknowledged().command().unwrap();
		let keys: Vec<&str> = cmd.raw().unwrap().keys().collect();
		assert_eq!(keys, vec!["getlasterror", "w"]);

		let wc = WriteConcern {
			mode: Some("majority".into()),
			w: 3,
			wtimeout_ms: 500,
			journal: true,
			fsync: false,
		};
		let cmd = wc.command().unwrap();
		assert_eq!(cmd.find("w").unwrap().as_str(), "majority");
		assert_eq!(cmd.find("wtimeout").unwrap().as_i32(), 500);
		assert_eq!(cmd.find("j").unwrap().as_i32(), 1);
		assert!(cmd.find("fsync").is_none());
	}
}
