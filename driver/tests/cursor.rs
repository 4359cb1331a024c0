//! Cursor paging against servers with different page sizes

mod common;

use common::{connect, doc, reply_to, scripted_peer, server, server_with};
use docwire_driver::docwire_core::Token;
use docwire_driver::docwire_core::network::HEADER_LEN;
use docwire_driver::{Bson, Connection, CursorState, DocWireError, WriteConcern, query_flags};
use docwire_server::ServerConfig;
use pretty_assertions::assert_eq;

fn fill(conn: &mut Connection, ns: &str, count: i32) {
	let docs: Vec<Bson> = (0..count).map(|i| doc(&["i".into(), i.into()])).collect();
	for chunk in docs.chunks(250) {
		conn.insert_batch(ns, chunk, None, 0).unwrap();
	}
	conn.get_last_error("test").unwrap();
}

fn sorted_by_i() -> Bson {
	doc(&[
		"$query".into(),
		Token::OpenDoc,
		Token::CloseDoc,
		"$orderby".into(),
		Token::OpenDoc,
		"i".into(),
		1.into(),
		Token::CloseDoc,
	])
}

#[test]
fn test_limit_holds_for_any_batch_size() {
	for batch_size in [1, 3, 7, 101] {
		let mut config = ServerConfig::default();
		config.batch_size = batch_size;
		let server = server_with(config);
		let mut conn = connect(&server);
		fill(&mut conn, "test.nums", 1000);

		let mut cursor = conn.find("test.nums", &sorted_by_i(), None, 10, 0, 0).unwrap();
		let mut seen = Vec::new();
		while let Some(d) = cursor.next().unwrap() {
			seen.push(d.find("i").unwrap().as_i32());
		}
		assert_eq!(seen, (0..10).collect::<Vec<_>>(), "batch size {}", batch_size);
		assert_eq!(cursor.state(), CursorState::Exhausted);
	}
}

#[test]
fn test_unlimited_cursor_pages_through_everything() {
	let mut config = ServerConfig::default();
	config.batch_size = 7;
	let server = server_with(config);
	let mut conn = connect(&server);
	fill(&mut conn, "test.nums", 100);

	let mut cursor = conn.find("test.nums", &sorted_by_i(), None, 0, 5, 0).unwrap();
	let all = cursor.collect_all().unwrap();
	assert_eq!(all.len(), 95);
	assert_eq!(all[0].find("i").unwrap().as_i32(), 5);
	assert_eq!(cursor.seen(), 95);
	assert_eq!(cursor.cursor_id(), 0);
}

#[test]
fn test_projection() {
	let server = server();
	let mut conn = connect(&server);
	let full = doc(&["a".into(), 1.into(), "b".into(), 2.into(), "c".into(), 3.into()]);
	conn.insert("test.p", &full, Some(&WriteConcern::acknowledged())).unwrap();

	let fields = doc(&["b".into(), 1.into()]);
	let found = conn
		.find_one("test.p", &Bson::empty(), Some(&fields))
		.unwrap()
		.unwrap();
	let keys: Vec<&str> = found.view().keys().collect();
	assert_eq!(keys, vec!["_id", "b"]);
}

#[test]
fn test_close_kills_server_cursor() {
	let mut config = ServerConfig::default();
	config.batch_size = 2;
	let server = server_with(config);
	let mut conn = connect(&server);
	fill(&mut conn, "test.nums", 10);

	let mut cursor = conn.find("test.nums", &Bson::empty(), None, 0, 0, 0).unwrap();
	assert!(cursor.next().unwrap().is_some());
	let id = cursor.cursor_id();
	assert_ne!(id, 0);
	assert!(server.state().cursors.contains_key(&id));
	cursor.close().unwrap();

	// The kill is fire-and-forget; a round trip makes sure it landed.
	conn.check_connection().unwrap();
	assert!(!server.state().cursors.contains_key(&id));
}

#[test]
fn test_lost_server_cursor() {
	let mut config = ServerConfig::default();
	config.batch_size = 2;
	let server = server_with(config);
	let mut conn = connect(&server);
	fill(&mut conn, "test.nums", 10);

	let state = server.state();
	let mut cursor = conn.find("test.nums", &Bson::empty(), None, 0, 0, 0).unwrap();
	assert!(cursor.next().unwrap().is_some());
	assert!(cursor.next().unwrap().is_some());
	state.cursors.clear();

	assert!(matches!(cursor.next(), Err(DocWireError::CursorInvalid)));
	assert_eq!(cursor.state(), CursorState::Errored);
	assert!(matches!(cursor.next(), Err(DocWireError::CursorInvalid)));
}

#[test]
fn test_malformed_document_invalidates_cursor() {
	let port = scripted_peer(|request| {
		let good = doc(&["i".into(), 0.into()]);
		let mut bytes = reply_to(request, 0, &[good.view()]);
		// A second document whose terminator byte is wrong.
		bytes.extend_from_slice(&[5, 0, 0, 0, 1]);
		let len = bytes.len() as i32;
		bytes[..4].copy_from_slice(&len.to_le_bytes());
		bytes[HEADER_LEN + 16..HEADER_LEN + 20].copy_from_slice(&2i32.to_le_bytes());
		Some(bytes)
	});
	let mut conn = Connection::new();
	conn.connect("127.0.0.1", port).unwrap();

	let mut cursor = conn.find("test.c", &Bson::empty(), None, 0, 0, 0).unwrap();
	assert_eq!(cursor.next().unwrap().map(|d| d.find("i").unwrap().as_i32()), Some(0));
	assert!(matches!(cursor.next(), Err(DocWireError::Bson(_))));
	assert_eq!(cursor.state(), CursorState::Errored);
	assert!(matches!(cursor.next(), Err(DocWireError::CursorInvalid)));
}

#[test]
fn test_query_failure() {
	let server = server();
	let mut conn = connect(&server);
	fill(&mut conn, "test.nums", 3);

	let bad = doc(&["i".into(), Token::OpenDoc, "$bogus".into(), 1.into(), Token::CloseDoc]);
	let err = conn.find("test.nums", &bad, None, 0, 0, 0).unwrap_err();
	assert!(matches!(err, DocWireError::QueryFailed(_)), "{:?}", err);
	assert_eq!(conn.server_error().unwrap().code, 2);
}

#[test]
fn test_tailable_cursor_waits_for_new_documents() {
	let server = server();
	let mut writer = connect(&server);
	writer.create_capped_collection("test", "events", 1 << 20, 0).unwrap();
	fill(&mut writer, "test.events", 3);

	let mut reader = connect(&server);
	let mut cursor = reader
		.find("test.events", &Bson::empty(), None, 0, 0, query_flags::TAILABLE)
		.unwrap();
	let mut got = Vec::new();
	while let Some(d) = cursor.next().unwrap() {
		got.push(d.find("i").unwrap().as_i32());
	}
	assert_eq!(got, vec![0, 1, 2]);
	assert_eq!(cursor.state(), CursorState::Pending);
	assert_ne!(cursor.cursor_id(), 0);

	writer
		.insert("test.events", &doc(&["i".into(), 3.into()]), Some(&WriteConcern::acknowledged()))
		.unwrap();
	let next = cursor.next().unwrap().map(|d| d.find("i").unwrap().as_i32());
	assert_eq!(next, Some(3));
	assert!(cursor.next().unwrap().is_none());
	assert_eq!(cursor.state(), CursorState::Pending);
}
