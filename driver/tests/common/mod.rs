//! Helpers shared by the integration tests

#![allow(dead_code)]

use docwire_driver::docwire_core::network::{HEADER_LEN, MsgHeader, Reply};
use docwire_driver::docwire_core::notation::build;
use docwire_driver::docwire_core::Token;
use docwire_driver::{Bson, Connection, RawDoc};
use docwire_server::{ServerConfig, TestServer};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::thread;

static TRACING: Once = Once::new();

/// Routes `RUST_LOG` output through the test harness.
pub fn init_tracing() {
	TRACING.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}

pub fn server() -> TestServer {
	init_tracing();
	TestServer::start().unwrap()
}

pub fn server_with(config: ServerConfig) -> TestServer {
	init_tracing();
	TestServer::with_config(config).unwrap()
}

pub fn connect(server: &TestServer) -> Connection {
	let mut conn = Connection::new();
	conn.connect("127.0.0.1", server.port()).unwrap();
	conn
}

pub fn doc(tokens: &[Token<'_>]) -> Bson {
	build(tokens).unwrap()
}

/// Encodes a reply to `request` carrying `docs`.
pub fn reply_to(request: &MsgHeader, cursor_id: i64, docs: &[RawDoc<'_>]) -> Vec<u8> {
	Reply::encode(1, request.request_id, 0, cursor_id, 0, docs).to_vec()
}

/// A bare TCP peer that answers the `ismaster` handshake as a primary and
/// passes every later request to `respond`. Returning `None` leaves the
/// request unanswered. Returns the port it listens on.
pub fn scripted_peer<F>(mut respond: F) -> u16
where
	F: FnMut(&MsgHeader) -> Option<Vec<u8>> + Send + 'static,
{
	init_tracing();
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();
	thread::spawn(move || {
		let Ok((mut stream, _)) = listener.accept() else {
			return;
		};
		let hello = doc(&["ismaster".into(), true.into(), "ok".into(), 1.0.into()]);
		let mut greeted = false;
		while let Some(header) = read_request(&mut stream) {
			let reply = if greeted {
				respond(&header)
			} else {
				greeted = true;
				Some(reply_to(&header, 0, &[hello.view()]))
			};
			if let Some(bytes) = reply {
				if stream.write_all(&bytes).is_err() {
					return;
				}
			}
		}
	});
	port
}

fn read_request(stream: &mut TcpStream) -> Option<MsgHeader> {
	let mut raw = [0u8; HEADER_LEN];
	stream.read_exact(&mut raw).ok()?;
	let header = MsgHeader::decode(&raw).ok()?;
	let mut body = vec![0u8; (header.len as usize).checked_sub(HEADER_LEN)?];
	stream.read_exact(&mut body).ok()?;
	Some(header)
}
