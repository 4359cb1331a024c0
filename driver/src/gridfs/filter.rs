use docwire_core::{DocWireError, DocWireResult};
use std::fmt;

/// Transforms chunk payloads on their way to and from the server.
pub trait ChunkFilter: Send + Sync + fmt::Debug {
	fn name(&self) -> &'static str;

	/// Applied to a chunk before it is stored.
	fn encode(&self, chunk: &[u8]) -> DocWireResult<Vec<u8>>;

	/// Applied to a stored chunk after it is fetched.
	fn decode(&self, stored: &[u8]) -> DocWireResult<Vec<u8>>;
}

/// LZ4 block compression with the uncompressed size prepended.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Filter;

impl ChunkFilter for Lz4Filter {
	fn name(&self) -> &'static str {
		"lz4"
	}

	fn encode(&self, chunk: &[u8]) -> DocWireResult<Vec<u8>> {
		Ok(lz4_flex::compress_prepend_size(chunk))
	}

	fn decode(&self, stored: &[u8]) -> DocWireResult<Vec<u8>> {
		lz4_flex::decompress_size_prepended(stored)
			.map_err(|e| DocWireError::InvalidInput(format!("corrupt lz4 chunk: {}", e)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lz4_compresses_repetitive_chunks() {
		let chunk = b"abcdefgh".repeat(4096);
		let stored = Lz4Filter.encode(&chunk).unwrap();
		assert!(stored.len() < chunk.len() / 4);
		assert_eq!(Lz4Filter.decode(&stored).unwrap(), chunk);
	}

	#[test]
	fn test_lz4_rejects_garbage() {
		assert!(matches!(
			Lz4Filter.decode(&[16, 0, 0, 0, 0xf0]),
			Err(DocWireError::InvalidInput(_))
		));
	}
}
