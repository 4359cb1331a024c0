//! Binary document codec
//!
//! Documents are built incrementally into a single growable buffer and
//! read back through zero-copy views. A document is a little-endian
//! int32 total length, a sequence of elements, and a trailing zero byte.
//! Each element is a type tag, a NUL-terminated key, and a value whose
//! width depends on the tag.

mod display;
mod document;
mod error;
mod iter;
mod oid;
mod types;
mod value;

pub use document::Bson;
pub use error::{BsonError, BsonResult};
pub use iter::{BsonIter, Element, RawDoc};
pub use oid::{Oid, OidGenerator};
pub use types::{BsonType, Timestamp, ValidityFlags, subtype};
pub use value::Value;

/// Largest document the codec will build or accept.
pub const MAX_DOCUMENT_SIZE: usize = i32::MAX as usize;

/// Smallest well-formed document: length prefix plus terminator.
pub const MIN_DOCUMENT_SIZE: usize = 5;

pub(crate) static EMPTY_DOCUMENT: [u8; 5] = [5, 0, 0, 0, 0];

pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> Option<i32> {
    let slice = bytes.get(offset..offset + 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Some(i32::from_le_bytes(buf))
}

pub(crate) fn read_i64(bytes: &[u8], offset: usize) -> Option<i64> {
    let slice = bytes.get(offset..offset + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Some(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests;
