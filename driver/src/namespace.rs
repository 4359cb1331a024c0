//! `database.collection` names

use docwire_core::{DocWireError, DocWireResult};

pub const MAX_NAMESPACE_LEN: usize = 128;

fn invalid<T>(msg: impl Into<String>) -> DocWireResult<T> {
	Err(DocWireError::InvalidNamespace(msg.into()))
}

/// Checks a namespace before it is used as an insert target.
pub fn validate(ns: &str) -> DocWireResult<()> {
	if ns.starts_with('.') {
		return invalid("namespace cannot start with '.'");
	}
	let Some((db, collection)) = ns.split_once('.') else {
		return invalid("namespace has no collection part");
	};
	if collection.is_empty() {
		return invalid("collection name missing");
	}
	if collection.starts_with('.') {
		return invalid("collection cannot start with '.'");
	}
	if db.is_empty() {
		return invalid("database name missing");
	}
	if db.contains([' ', '$', '/', '\\']) {
		return invalid("database name may not contain ' ', '$', '/', or '\\'");
	}
	if collection.contains("..") {
		return invalid("collection may not contain two consecutive '.'");
	}
	if collection.contains('$') {
		return invalid("collection may not contain '$'");
	}
	if ns.len() > MAX_NAMESPACE_LEN {
		return invalid(format!(
			"namespace too long; has {} but must be <= {}",
			ns.len(),
			MAX_NAMESPACE_LEN
		));
	}
	if collection.ends_with('.') {
		return invalid("collection may not end with '.'");
	}
	Ok(())
}

/// Database part of a namespace (everything before the first dot).
pub fn database(ns: &str) -> &str {
	ns.split_once('.').map_or(ns, |(db, _)| db)
}

/// Command namespace for the database owning `ns`.
pub fn command_ns(ns: &str) -> String {
	format!("{}.$cmd", database(ns))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_valid_namespaces() {
		for ns in ["test.c", "test.system.indexes", "a.b.c", "db.fs.chunks"] {
			assert!(validate(ns).is_ok(), "{}", ns);
		}
	}

	#[test]
	fn test_invalid_namespaces() {
		for ns in [
			".test",
			"test",
			"test.",
			"test..c",
			".c",
			"te st.c",
			"te$t.c",
			"te/t.c",
			"te\\t.c",
			"test.c..d",
			"test.c$",
			"test.c.",
		] {
			assert!(
				matches!(validate(ns), Err(DocWireError::InvalidNamespace(_))),
				"{}",
				ns
			);
		}
		let long = format!("db.{}", "c".repeat(126));
		assert!(validate(&long).is_err());
		let fits = format!("db.{}", "c".repeat(125));
		assert!(validate(&fits).is_ok());
	}

	#[test]
	fn test_command_ns() {
		assert_eq!(command_ns("test.people"), "test.$cmd");
		assert_eq!(command_ns("admin"), "admin.$cmd");
		assert_eq!(database("a.b.c"), "a");
	}
}
