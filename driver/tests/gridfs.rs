//! Chunked file storage round trips

mod common;

use common::{connect, doc, server};
use docwire_driver::{
	Connection, DocWireError, FileMode, GridFile, GridFs, GridFsConfig, Lz4Filter, file_flags,
};
use pretty_assertions::assert_eq;
use rand::Rng;
use std::io::Write;

const CHUNK: usize = 1024;

fn content(len: usize) -> Vec<u8> {
	let mut data = vec![0u8; len];
	rand::thread_rng().fill(&mut data[..]);
	data
}

fn stored_chunks(conn: &mut Connection, file: &GridFile) -> i64 {
	let query = doc(&["files_id".into(), (*file.id()).into()]);
	conn.count("test", "fs.chunks", Some(&query)).unwrap()
}

fn open_store(conn: &mut Connection) -> GridFs {
	GridFs::open(conn, "test", GridFsConfig::default().with_chunk_size(CHUNK)).unwrap()
}

fn read_all(file: &mut GridFile, conn: &mut Connection) -> Vec<u8> {
	let mut out = Vec::new();
	let written = file.write_to(conn, &mut out).unwrap();
	assert_eq!(written, out.len() as u64);
	out
}

fn read_with_small_buffer(file: &mut GridFile, conn: &mut Connection) -> Vec<u8> {
	file.seek(0);
	let mut out = Vec::new();
	let mut buf = [0u8; 100];
	loop {
		let n = file.read(conn, &mut buf).unwrap();
		if n == 0 {
			break;
		}
		out.extend_from_slice(&buf[..n]);
	}
	out
}

#[test]
fn test_round_trip_around_chunk_boundaries() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);

	for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 4 * CHUNK + 7] {
		let data = content(len);
		let name = format!("file-{}", len);
		let stored = fs.store_buffer(&mut conn, &data, &name, Some("application/octet-stream"), 0)
			.unwrap();
		assert_eq!(stored.length(), len as u64);
		assert_eq!(stored.num_chunks(), len.div_ceil(CHUNK) as u64);

		let mut file = fs.find_filename(&mut conn, &name).unwrap();
		assert_eq!(file.mode(), FileMode::Reader);
		assert_eq!(file.length(), len as u64);
		assert_eq!(file.chunk_size(), CHUNK);
		assert_eq!(file.content_type(), Some("application/octet-stream"));
		assert_eq!(file.md5(), Some(format!("{:x}", md5::compute(&data)).as_str()));
		assert!(file.upload_date_time().is_some());
		assert_eq!(read_all(&mut file, &mut conn), data, "length {}", len);
		assert_eq!(read_with_small_buffer(&mut file, &mut conn), data, "length {}", len);
	}
}

#[test]
fn test_truncate_around_chunk_boundaries() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);

	for len in [CHUNK - 1, CHUNK, CHUNK + 1, 4 * CHUNK + 7] {
		let data = content(len);
		let name = format!("t-{}", len);
		let stored = fs.store_buffer(&mut conn, &data, &name, None, 0).unwrap();
		assert_eq!(stored_chunks(&mut conn, &stored), len.div_ceil(CHUNK) as i64);

		let cut = len - 37;
		let mut file = fs.open_for_update(&mut conn, &name).unwrap();
		assert_eq!(file.truncate(&mut conn, cut as u64).unwrap(), cut as u64);
		file.close(&mut conn).unwrap();

		let mut file = fs.find_filename(&mut conn, &name).unwrap();
		assert_eq!(file.length(), cut as u64, "length {}", len);
		assert_eq!(file.num_chunks(), cut.div_ceil(CHUNK) as u64);
		assert_eq!(stored_chunks(&mut conn, &file), cut.div_ceil(CHUNK) as i64, "length {}", len);
		assert_eq!(read_all(&mut file, &mut conn), &data[..cut], "length {}", len);
		assert_eq!(file.md5(), Some(format!("{:x}", md5::compute(&data[..cut])).as_str()));
	}
}

#[test]
fn test_truncate_then_expand() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);
	let len = 4 * CHUNK + 7;
	let data = content(len);
	fs.store_buffer(&mut conn, &data, "t", None, 0).unwrap();

	let mut file = fs.open_for_update(&mut conn, "t").unwrap();
	file.truncate(&mut conn, (2 * CHUNK) as u64).unwrap();
	file.set_size(&mut conn, (3 * CHUNK + 5) as u64).unwrap();
	file.close(&mut conn).unwrap();

	let mut expected = data[..2 * CHUNK].to_vec();
	expected.resize(3 * CHUNK + 5, 0);
	let mut file = fs.find_filename(&mut conn, "t").unwrap();
	assert_eq!(file.num_chunks(), 4);
	assert_eq!(stored_chunks(&mut conn, &file), 4);
	assert_eq!(read_all(&mut file, &mut conn), expected);
}

#[test]
fn test_random_access_writes() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);
	let len = 4 * CHUNK + 7;

	// (offset, patch length): from the middle across a boundary, a short
	// write straddling chunks 1 and 2, and one running past the end.
	for (case, (at, patch_len)) in [(len / 2 - 3, CHUNK + 5), (2 * CHUNK - 3, 10), (len - 4, 20)]
		.into_iter()
		.enumerate()
	{
		let mut data = vec![0u8; len];
		rand::thread_rng().fill(&mut data[..]);
		let name = format!("w{}", case);
		fs.store_buffer(&mut conn, &data, &name, None, 0).unwrap();

		let patch = vec![0xAAu8; patch_len];
		let mut file = fs.open_for_update(&mut conn, &name).unwrap();
		assert_eq!(file.seek(at as u64), at as u64);
		assert_eq!(file.write(&mut conn, &patch).unwrap(), patch_len);
		file.close(&mut conn).unwrap();

		data.resize(len.max(at + patch_len), 0);
		data[at..at + patch_len].copy_from_slice(&patch);

		let mut file = fs.find_filename(&mut conn, &name).unwrap();
		assert_eq!(file.length(), len.max(at + patch_len) as u64);
		assert_eq!(read_all(&mut file, &mut conn), data, "case {}", case);
		assert_eq!(file.md5(), Some(format!("{:x}", md5::compute(&data)).as_str()));
	}
}

#[test]
fn test_reader_seek_clamps_to_length() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);
	let data = content(CHUNK + 50);
	fs.store_buffer(&mut conn, &data, "r", None, 0).unwrap();

	let mut file = fs.find_filename(&mut conn, "r").unwrap();
	assert_eq!(file.seek(CHUNK as u64 - 2), CHUNK as u64 - 2);
	let mut buf = [0u8; 4];
	assert_eq!(file.read(&mut conn, &mut buf).unwrap(), 4);
	assert_eq!(&buf[..], &data[CHUNK - 2..CHUNK + 2]);

	assert_eq!(file.seek(10 * data.len() as u64), data.len() as u64);
	assert_eq!(file.read(&mut conn, &mut buf).unwrap(), 0);
	assert!(matches!(
		file.write(&mut conn, b"nope"),
		Err(DocWireError::InvalidInput(_))
	));
}

#[test]
fn test_write_past_end_zero_fills() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);

	let mut file = fs.create_file("sparse", None, file_flags::NO_MD5);
	file.write(&mut conn, b"head").unwrap();
	file.seek((CHUNK + 10) as u64);
	file.write(&mut conn, b"tail").unwrap();
	file.close(&mut conn).unwrap();
	assert!(file.md5().is_none());

	let mut expected = b"head".to_vec();
	expected.resize(CHUNK + 10, 0);
	expected.extend_from_slice(b"tail");
	let mut file = fs.find_filename(&mut conn, "sparse").unwrap();
	assert_eq!(read_all(&mut file, &mut conn), expected);
	assert_eq!(file.chunk(&mut conn, 1).unwrap(), &expected[CHUNK..]);
	assert!(matches!(file.chunk(&mut conn, 2), Err(DocWireError::InvalidInput(_))));
}

#[test]
fn test_lz4_filtered_store() {
	let server = server();
	let mut conn = connect(&server);
	let fs = GridFs::open(
		&mut conn,
		"test",
		GridFsConfig::default()
			.with_prefix("packed")
			.with_chunk_size(CHUNK)
			.with_filter(Lz4Filter),
	)
	.unwrap();
	assert_eq!(fs.files_ns(), "test.packed.files");
	assert_eq!(fs.filter().unwrap().name(), "lz4");

	let data = b"compressible ".repeat(700);
	let stored = fs.store_buffer(&mut conn, &data, "z", None, 0).unwrap();
	assert!(stored.is_compressed());
	assert!(stored.md5().is_none());

	let mut file = fs.find_filename(&mut conn, "z").unwrap();
	assert!(file.is_compressed());
	assert_eq!(read_all(&mut file, &mut conn), data);
	assert_eq!(read_with_small_buffer(&mut file, &mut conn), data);

	let raw = {
		let mut cursor = file.chunks(&mut conn, 0, 1).unwrap();
		let first = cursor.next().unwrap().unwrap();
		let len = first.find("data").unwrap().bin_data().len();
		len
	};
	assert!(raw < CHUNK, "stored chunk of {} bytes", raw);

	// Without the filter the same files cannot be decoded.
	let plain = GridFs::open(
		&mut conn,
		"test",
		GridFsConfig::default().with_prefix("packed").with_chunk_size(CHUNK),
	)
	.unwrap();
	let mut file = plain.find_filename(&mut conn, "z").unwrap();
	let mut buf = [0u8; 16];
	assert!(matches!(file.read(&mut conn, &mut buf), Err(DocWireError::InvalidInput(_))));
}

#[test]
fn test_store_file_from_disk() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);

	let data = content(3 * CHUNK + 100);
	let mut source = tempfile::NamedTempFile::new().unwrap();
	source.write_all(&data).unwrap();
	source.flush().unwrap();

	let stored = fs
		.store_file(&mut conn, source.path(), Some("from-disk"), Some("text/plain"), 0)
		.unwrap();
	assert_eq!(stored.length(), data.len() as u64);

	let mut file = fs.find_filename(&mut conn, "from-disk").unwrap();
	assert_eq!(read_all(&mut file, &mut conn), data);
	assert_eq!(file.md5(), Some(format!("{:x}", md5::compute(&data)).as_str()));
}

#[test]
fn test_list_and_remove() {
	let server = server();
	let mut conn = connect(&server);
	let fs = open_store(&mut conn);

	for name in ["b", "a", "c"] {
		fs.store_buffer(&mut conn, &content(CHUNK + 1), name, None, 0)
			.unwrap();
	}
	let names: Vec<String> = fs
		.list(&mut conn, None)
		.unwrap()
		.iter()
		.map(|f| f.filename().to_string())
		.collect();
	assert_eq!(names, vec!["a", "b", "c"]);

	let only_b = doc(&["filename".into(), "b".into()]);
	assert_eq!(fs.list(&mut conn, Some(&only_b)).unwrap().len(), 1);

	assert_eq!(fs.remove_filename(&mut conn, "b").unwrap(), 1);
	assert_eq!(fs.remove_filename(&mut conn, "b").unwrap(), 0);
	assert!(matches!(
		fs.find_filename(&mut conn, "b"),
		Err(DocWireError::FileNotFound(name)) if name == "b"
	));
	assert_eq!(conn.count("test", "fs.chunks", None).unwrap(), 4);
	assert_eq!(fs.list(&mut conn, None).unwrap().len(), 2);
}

#[test]
fn test_zero_chunk_size_rejected() {
	let server = server();
	let mut conn = connect(&server);
	let err = GridFs::open(&mut conn, "test", GridFsConfig::default().with_chunk_size(0)).unwrap_err();
	assert!(matches!(err, DocWireError::InvalidInput(_)));
}
