//! Zero-copy read views over finished documents

use super::error::{BsonError, BsonResult};
use super::oid::Oid;
use super::types::{BsonType, Timestamp, subtype};
use super::{EMPTY_DOCUMENT, MIN_DOCUMENT_SIZE, read_i32, read_i64};
use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

/// Borrowed view of an encoded document.
#[derive(Clone, Copy)]
pub struct RawDoc<'a> {
    data: &'a [u8],
}

impl<'a> RawDoc<'a> {
    /// Checks the length prefix and terminator, and slices `data` to the
    /// declared size.
    pub fn from_bytes(data: &'a [u8]) -> BsonResult<Self> {
        let declared = read_i32(data, 0)
            .ok_or_else(|| BsonError::Malformed("missing length prefix".into()))?;
        if declared < MIN_DOCUMENT_SIZE as i32 {
            return Err(BsonError::Malformed(format!(
                "declared length {} is too small",
                declared
            )));
        }
        let declared = declared as usize;
        if declared > data.len() {
            return Err(BsonError::Malformed(format!(
                "declared length {} exceeds {} available bytes",
                declared,
                data.len()
            )));
        }
        if data[declared - 1] != 0 {
            return Err(BsonError::Malformed("missing terminator".into()));
        }
        Ok(Self {
            data: &data[..declared],
        })
    }

    pub(crate) fn from_validated(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn empty() -> RawDoc<'static> {
        RawDoc {
            data: &EMPTY_DOCUMENT,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= MIN_DOCUMENT_SIZE
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn iter(&self) -> BsonIter<'a> {
        BsonIter::new(*self)
    }

    /// First element with the given key.
    pub fn find(&self, key: &str) -> Option<Element<'a>> {
        self.iter().find(|e| e.key_bytes() == key.as_bytes())
    }

    /// Follows a dotted path through embedded documents and arrays.
    pub fn find_path(&self, path: &str) -> Option<Element<'a>> {
        let mut parts = path.split('.');
        let mut current = self.find(parts.next()?)?;
        for part in parts {
            match current.kind() {
                BsonType::Object | BsonType::Array => {
                    current = current.as_document().find(part)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn keys(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        self.iter().map(|e| e.key())
    }
}

impl PartialEq for RawDoc<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl std::fmt::Debug for RawDoc<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawDoc({})", self.to_json())
    }
}

impl<'a> IntoIterator for RawDoc<'a> {
    type Item = Element<'a>;
    type IntoIter = BsonIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Forward iterator over the elements of a document.
///
/// Stops at the terminator. A malformed element also stops iteration
/// and is reported through `is_corrupt`.
#[derive(Clone)]
pub struct BsonIter<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
    corrupt: bool,
}

impl<'a> BsonIter<'a> {
    pub fn new(doc: RawDoc<'a>) -> Self {
        Self {
            data: doc.data,
            pos: 4,
            done: false,
            corrupt: false,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    fn fail(&mut self, reason: &str) -> Option<Element<'a>> {
        warn!("stopping iteration at offset {}: {}", self.pos, reason);
        self.done = true;
        self.corrupt = true;
        None
    }
}

/// Byte width of a value, derived from its type tag.
fn value_size(kind: BsonType, data: &[u8], start: usize) -> Option<usize> {
    let size = match kind {
        BsonType::Eoo
        | BsonType::Undefined
        | BsonType::Null
        | BsonType::MinKey
        | BsonType::MaxKey => 0,
        BsonType::Bool => 1,
        BsonType::Int => 4,
        BsonType::Double | BsonType::Date | BsonType::Timestamp | BsonType::Long => 8,
        BsonType::Oid => 12,
        BsonType::String | BsonType::Code | BsonType::Symbol => {
            4 + usize::try_from(read_i32(data, start)?).ok()?
        }
        BsonType::Binary => 4 + 1 + usize::try_from(read_i32(data, start)?).ok()?,
        BsonType::Object | BsonType::Array | BsonType::CodeWithScope => {
            usize::try_from(read_i32(data, start)?).ok()?
        }
        BsonType::DbRef => 4 + 12 + usize::try_from(read_i32(data, start)?).ok()?,
        BsonType::Regex => {
            let rest = data.get(start..)?;
            let pattern_end = rest.iter().position(|&b| b == 0)?;
            let opts = rest.get(pattern_end + 1..)?;
            let opts_end = opts.iter().position(|&b| b == 0)?;
            pattern_end + 1 + opts_end + 1
        }
    };
    Some(size)
}

impl<'a> Iterator for BsonIter<'a> {
    type Item = Element<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // the final byte is the terminator
        let end = self.data.len().saturating_sub(1);
        if self.pos >= end {
            self.done = true;
            return None;
        }

        let tag = self.data[self.pos];
        if tag == 0 {
            self.done = true;
            return None;
        }
        let Some(kind) = BsonType::from_u8(tag) else {
            return self.fail(&format!("unknown type tag 0x{:02x}", tag));
        };

        let key_start = self.pos + 1;
        let Some(key_len) = self.data[key_start..end].iter().position(|&b| b == 0) else {
            return self.fail("unterminated key");
        };
        let value_start = key_start + key_len + 1;
        let Some(size) = value_size(kind, &self.data[..end], value_start) else {
            return self.fail("value length out of range");
        };
        if value_start + size > end {
            return self.fail("value overruns document");
        }

        let elem = Element {
            kind,
            raw: &self.data[self.pos..value_start + size],
            key: &self.data[key_start..key_start + key_len],
            value: &self.data[value_start..value_start + size],
            value_offset: value_start,
        };
        self.pos = value_start + size;
        Some(elem)
    }
}

/// One element of a document. Typed accessors return a default value
/// when the element holds a different type.
#[derive(Clone, Copy)]
pub struct Element<'a> {
    kind: BsonType,
    raw: &'a [u8],
    key: &'a [u8],
    value: &'a [u8],
    value_offset: usize,
}

impl<'a> Element<'a> {
    pub fn kind(&self) -> BsonType {
        self.kind
    }

    /// Key as text; empty if the key is not valid UTF-8.
    pub fn key(&self) -> &'a str {
        std::str::from_utf8(self.key).unwrap_or("")
    }

    pub fn key_bytes(&self) -> &'a [u8] {
        self.key
    }

    /// Offset of the value from the start of the enclosing document.
    pub fn value_offset(&self) -> usize {
        self.value_offset
    }

    pub fn value_bytes(&self) -> &'a [u8] {
        self.value
    }

    /// The full encoded element: tag, key and value.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    fn raw_i32(&self) -> i32 {
        read_i32(self.value, 0).unwrap_or(0)
    }

    fn raw_i64(&self) -> i64 {
        read_i64(self.value, 0).unwrap_or(0)
    }

    fn raw_f64(&self) -> f64 {
        f64::from_bits(self.raw_i64() as u64)
    }

    pub fn as_f64(&self) -> f64 {
        match self.kind {
            BsonType::Double => self.raw_f64(),
            BsonType::Int => self.raw_i32() as f64,
            BsonType::Long => self.raw_i64() as f64,
            _ => 0.0,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self.kind {
            BsonType::Double => self.raw_f64() as i32,
            BsonType::Int => self.raw_i32(),
            BsonType::Long => self.raw_i64() as i32,
            _ => 0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self.kind {
            BsonType::Double => self.raw_f64() as i64,
            BsonType::Int => self.raw_i32() as i64,
            BsonType::Long => self.raw_i64(),
            _ => 0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self.kind {
            BsonType::Bool => self.value.first().copied().unwrap_or(0) != 0,
            BsonType::Int => self.raw_i32() != 0,
            BsonType::Long => self.raw_i64() != 0,
            BsonType::Double => self.raw_f64() != 0.0,
            BsonType::Eoo | BsonType::Null | BsonType::Undefined => false,
            _ => true,
        }
    }

    fn length_prefixed_str(&self, offset: usize) -> &'a str {
        let Some(len) = read_i32(self.value, offset) else {
            return "";
        };
        let start = offset + 4;
        let Some(bytes) = len
            .checked_sub(1)
            .and_then(|len| usize::try_from(len).ok())
            .and_then(|len| self.value.get(start..start + len))
        else {
            return "";
        };
        std::str::from_utf8(bytes).unwrap_or("")
    }

    /// String payload of string and symbol elements.
    pub fn as_str(&self) -> &'a str {
        match self.kind {
            BsonType::String | BsonType::Symbol => self.length_prefixed_str(0),
            _ => "",
        }
    }

    /// Byte length of a string payload, not counting the terminator.
    pub fn string_len(&self) -> usize {
        match self.kind {
            BsonType::String | BsonType::Symbol | BsonType::Code => {
                (self.raw_i32() - 1).max(0) as usize
            }
            _ => 0,
        }
    }

    pub fn code(&self) -> &'a str {
        match self.kind {
            BsonType::Code => self.length_prefixed_str(0),
            BsonType::CodeWithScope => self.length_prefixed_str(4),
            _ => "",
        }
    }

    pub fn code_scope(&self) -> RawDoc<'a> {
        if self.kind != BsonType::CodeWithScope {
            return RawDoc::empty();
        }
        let Some(code_len) = read_i32(self.value, 4).and_then(|l| usize::try_from(l).ok())
        else {
            return RawDoc::empty();
        };
        self.value
            .get(8 + code_len..)
            .and_then(|bytes| RawDoc::from_bytes(bytes).ok())
            .unwrap_or_else(|| RawDoc::empty())
    }

    pub fn as_oid(&self) -> Oid {
        let bytes = match self.kind {
            BsonType::Oid => self.value,
            BsonType::DbRef => &self.value[self.value.len().saturating_sub(12)..],
            _ => return Oid::default(),
        };
        let mut oid = [0u8; 12];
        if bytes.len() == 12 {
            oid.copy_from_slice(bytes);
        }
        Oid::from_bytes(oid)
    }

    /// Milliseconds since the epoch.
    pub fn as_date(&self) -> i64 {
        match self.kind {
            BsonType::Date => self.raw_i64(),
            _ => 0,
        }
    }

    pub fn as_date_time(&self) -> Option<DateTime<Utc>> {
        match self.kind {
            BsonType::Date => Utc.timestamp_millis_opt(self.raw_i64()).single(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Timestamp {
        match self.kind {
            BsonType::Timestamp => Timestamp {
                increment: read_i32(self.value, 0).unwrap_or(0) as u32,
                seconds: read_i32(self.value, 4).unwrap_or(0) as u32,
            },
            _ => Timestamp::default(),
        }
    }

    pub fn bin_subtype(&self) -> u8 {
        match self.kind {
            BsonType::Binary => self.value.get(4).copied().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn bin_data(&self) -> &'a [u8] {
        if self.kind != BsonType::Binary {
            return &[];
        }
        if self.bin_subtype() == subtype::BINARY_OLD {
            let inner = read_i32(self.value, 5).unwrap_or(0).max(0) as usize;
            self.value.get(9..9 + inner).unwrap_or(&[])
        } else {
            self.value.get(5..).unwrap_or(&[])
        }
    }

    pub fn bin_len(&self) -> usize {
        self.bin_data().len()
    }

    fn regex_parts(&self) -> (&'a str, &'a str) {
        if self.kind != BsonType::Regex {
            return ("", "");
        }
        let mut parts = self.value.split(|&b| b == 0);
        let pattern = parts.next().unwrap_or(&[]);
        let options = parts.next().unwrap_or(&[]);
        (
            std::str::from_utf8(pattern).unwrap_or(""),
            std::str::from_utf8(options).unwrap_or(""),
        )
    }

    pub fn regex(&self) -> &'a str {
        self.regex_parts().0
    }

    pub fn regex_options(&self) -> &'a str {
        self.regex_parts().1
    }

    /// Namespace of a db pointer element.
    pub fn db_pointer_ns(&self) -> &'a str {
        match self.kind {
            BsonType::DbRef => self.length_prefixed_str(0),
            _ => "",
        }
    }

    /// Embedded document or array; the empty document otherwise.
    pub fn as_document(&self) -> RawDoc<'a> {
        match self.kind {
            BsonType::Object | BsonType::Array => RawDoc::from_bytes(self.value)
                .unwrap_or_else(|_| RawDoc::empty()),
            _ => RawDoc::empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.kind == BsonType::Null
    }
}

impl std::fmt::Debug for Element<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("key", &self.key())
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}
