//! Incremental document builder

use super::error::{BsonError, BsonResult};
use super::iter::{Element, RawDoc};
use super::oid::Oid;
use super::types::{BsonType, Timestamp, ValidityFlags, subtype};
use super::value::Value;
use super::{EMPTY_DOCUMENT, MAX_DOCUMENT_SIZE, MIN_DOCUMENT_SIZE};
use crate::CodecConfig;
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::fmt;
use tracing::warn;

/// A document under construction or, once `finish` succeeded, a
/// complete encoded document.
#[derive(Clone)]
pub struct Bson {
    data: Vec<u8>,
    stack: SmallVec<[usize; 8]>,
    finished: bool,
    flags: ValidityFlags,
    config: CodecConfig,
}

impl Bson {
    pub fn new() -> Self {
        Self::with_config(CodecConfig::default())
    }

    pub fn with_config(config: CodecConfig) -> Self {
        let mut data = Vec::with_capacity(config.initial_capacity.max(MIN_DOCUMENT_SIZE));
        // length placeholder, patched by finish()
        data.extend_from_slice(&[0u8; 4]);
        Self {
            data,
            stack: SmallVec::new(),
            finished: false,
            flags: ValidityFlags::NONE,
            config,
        }
    }

    /// A finished document with no elements.
    pub fn empty() -> Self {
        Self {
            data: EMPTY_DOCUMENT.to_vec(),
            stack: SmallVec::new(),
            finished: true,
            flags: ValidityFlags::NONE,
            config: CodecConfig::default(),
        }
    }

    /// Adopts an encoded document, checking its framing.
    pub fn from_bytes(data: Vec<u8>) -> BsonResult<Self> {
        let size = RawDoc::from_bytes(&data)?.size();
        let mut data = data;
        data.truncate(size);
        Ok(Self {
            data,
            stack: SmallVec::new(),
            finished: true,
            flags: ValidityFlags::NONE,
            config: CodecConfig::default(),
        })
    }

    pub fn from_raw(raw: RawDoc<'_>) -> Self {
        Self {
            data: raw.as_bytes().to_vec(),
            stack: SmallVec::new(),
            finished: true,
            flags: ValidityFlags::NONE,
            config: CodecConfig::default(),
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn flags(&self) -> ValidityFlags {
        self.flags
    }

    /// Current encoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Read view over a finished document.
    pub fn raw(&self) -> BsonResult<RawDoc<'_>> {
        if !self.finished {
            return Err(BsonError::NotFinished);
        }
        Ok(RawDoc::from_validated(&self.data))
    }

    /// Read view, or the empty document when still building.
    pub fn view(&self) -> RawDoc<'_> {
        if self.finished {
            RawDoc::from_validated(&self.data)
        } else {
            RawDoc::empty()
        }
    }

    pub fn find(&self, key: &str) -> Option<Element<'_>> {
        self.view().find(key)
    }

    /// Writes the terminator and patches the total length. Calling it
    /// again on a finished document is a no-op.
    pub fn finish(&mut self) -> BsonResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.stack.is_empty() {
            return Err(BsonError::UnclosedNesting(self.stack.len()));
        }
        if self.flags.contains(ValidityFlags::NOT_UTF8) {
            return Err(BsonError::InvalidUtf8("document"));
        }
        self.ensure_space(1)?;
        self.data.push(0);
        let total = self.data.len() as i32;
        self.data[0..4].copy_from_slice(&total.to_le_bytes());
        self.finished = true;
        Ok(())
    }

    fn ensure_space(&mut self, bytes_needed: usize) -> BsonResult<()> {
        let pos = self.data.len();
        let required = pos
            .checked_add(bytes_needed)
            .ok_or(BsonError::SizeOverflow(usize::MAX))?;
        if required <= self.data.capacity() {
            return Ok(());
        }
        if required > MAX_DOCUMENT_SIZE {
            warn!("document would grow to {} bytes", required);
            return Err(BsonError::SizeOverflow(required));
        }

        let grown = (self.data.capacity() + bytes_needed).saturating_mul(3) / 2;
        let new_size = grown.min(MAX_DOCUMENT_SIZE).max(required);
        if self.data.try_reserve_exact(new_size - pos).is_err() {
            return Err(self.config.fatal("failed to grow document buffer"));
        }
        Ok(())
    }

    fn check_utf8(&mut self, bytes: &[u8], what: &'static str) -> BsonResult<()> {
        if std::str::from_utf8(bytes).is_err() {
            self.flags.insert(ValidityFlags::NOT_UTF8);
            return Err(BsonError::InvalidUtf8(what));
        }
        Ok(())
    }

    fn check_cstring(&mut self, bytes: &[u8], what: &'static str) -> BsonResult<()> {
        if bytes.contains(&0) {
            return Err(BsonError::InteriorNul(what));
        }
        self.check_utf8(bytes, what)
    }

    fn check_key(&mut self, key: &[u8]) -> BsonResult<()> {
        self.check_cstring(key, "key")?;
        if key.first() == Some(&b'$') && !matches!(key, b"$ref" | b"$id" | b"$db") {
            self.flags.insert(ValidityFlags::FIELD_INIT_DOLLAR);
        }
        if key.contains(&b'.') {
            self.flags.insert(ValidityFlags::FIELD_HAS_DOT);
        }
        Ok(())
    }

    fn append_estart(&mut self, kind: BsonType, key: &[u8], data_size: usize) -> BsonResult<()> {
        if self.finished {
            return Err(BsonError::AlreadyFinished);
        }
        self.check_key(key)?;
        self.ensure_space(1 + key.len() + 1 + data_size)?;
        self.data.push(kind as u8);
        self.data.extend_from_slice(key);
        self.data.push(0);
        Ok(())
    }

    fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn put_string(&mut self, value: &[u8]) {
        self.put_i32(value.len() as i32 + 1);
        self.data.extend_from_slice(value);
        self.data.push(0);
    }

    fn put_cstring(&mut self, value: &[u8]) {
        self.data.extend_from_slice(value);
        self.data.push(0);
    }

    pub fn append_double(&mut self, key: impl AsRef<[u8]>, value: f64) -> BsonResult<()> {
        self.append_estart(BsonType::Double, key.as_ref(), 8)?;
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn append_int(&mut self, key: impl AsRef<[u8]>, value: i32) -> BsonResult<()> {
        self.append_estart(BsonType::Int, key.as_ref(), 4)?;
        self.put_i32(value);
        Ok(())
    }

    pub fn append_long(&mut self, key: impl AsRef<[u8]>, value: i64) -> BsonResult<()> {
        self.append_estart(BsonType::Long, key.as_ref(), 8)?;
        self.put_i64(value);
        Ok(())
    }

    pub fn append_bool(&mut self, key: impl AsRef<[u8]>, value: bool) -> BsonResult<()> {
        self.append_estart(BsonType::Bool, key.as_ref(), 1)?;
        self.data.push(value as u8);
        Ok(())
    }

    pub fn append_null(&mut self, key: impl AsRef<[u8]>) -> BsonResult<()> {
        self.append_estart(BsonType::Null, key.as_ref(), 0)
    }

    pub fn append_undefined(&mut self, key: impl AsRef<[u8]>) -> BsonResult<()> {
        self.append_estart(BsonType::Undefined, key.as_ref(), 0)
    }

    pub fn append_minkey(&mut self, key: impl AsRef<[u8]>) -> BsonResult<()> {
        self.append_estart(BsonType::MinKey, key.as_ref(), 0)
    }

    pub fn append_maxkey(&mut self, key: impl AsRef<[u8]>) -> BsonResult<()> {
        self.append_estart(BsonType::MaxKey, key.as_ref(), 0)
    }

    pub fn append_oid(&mut self, key: impl AsRef<[u8]>, oid: &Oid) -> BsonResult<()> {
        self.append_estart(BsonType::Oid, key.as_ref(), 12)?;
        self.data.extend_from_slice(oid.bytes());
        Ok(())
    }

    /// Appends a freshly generated object id and returns it.
    pub fn append_new_oid(&mut self, key: impl AsRef<[u8]>) -> BsonResult<Oid> {
        let oid = Oid::generate();
        self.append_oid(key, &oid)?;
        Ok(oid)
    }

    /// Milliseconds since the epoch.
    pub fn append_date(&mut self, key: impl AsRef<[u8]>, millis: i64) -> BsonResult<()> {
        self.append_estart(BsonType::Date, key.as_ref(), 8)?;
        self.put_i64(millis);
        Ok(())
    }

    pub fn append_time_t(&mut self, key: impl AsRef<[u8]>, seconds: i64) -> BsonResult<()> {
        self.append_date(key, seconds.saturating_mul(1000))
    }

    pub fn append_date_time(
        &mut self,
        key: impl AsRef<[u8]>,
        when: &DateTime<Utc>,
    ) -> BsonResult<()> {
        self.append_date(key, when.timestamp_millis())
    }

    pub fn append_timestamp(&mut self, key: impl AsRef<[u8]>, ts: Timestamp) -> BsonResult<()> {
        self.append_estart(BsonType::Timestamp, key.as_ref(), 8)?;
        self.data.extend_from_slice(&ts.increment.to_le_bytes());
        self.data.extend_from_slice(&ts.seconds.to_le_bytes());
        Ok(())
    }

    fn append_string_base(
        &mut self,
        kind: BsonType,
        key: &[u8],
        value: &[u8],
    ) -> BsonResult<()> {
        if self.finished {
            return Err(BsonError::AlreadyFinished);
        }
        self.check_utf8(value, "string value")?;
        self.append_estart(kind, key, 4 + value.len() + 1)?;
        self.put_string(value);
        Ok(())
    }

    pub fn append_string(&mut self, key: impl AsRef<[u8]>, value: &str) -> BsonResult<()> {
        self.append_string_base(BsonType::String, key.as_ref(), value.as_bytes())
    }

    /// Appends unvalidated bytes as a string value. Invalid UTF-8 fails
    /// the append and leaves the document unable to finish.
    pub fn append_string_bytes(
        &mut self,
        key: impl AsRef<[u8]>,
        value: &[u8],
    ) -> BsonResult<()> {
        self.append_string_base(BsonType::String, key.as_ref(), value)
    }

    /// Appends a string under a key given as raw bytes.
    pub fn append_key_bytes(&mut self, key: &[u8], value: &str) -> BsonResult<()> {
        self.append_string_base(BsonType::String, key, value.as_bytes())
    }

    pub fn append_symbol(&mut self, key: impl AsRef<[u8]>, value: &str) -> BsonResult<()> {
        self.append_string_base(BsonType::Symbol, key.as_ref(), value.as_bytes())
    }

    pub fn append_code(&mut self, key: impl AsRef<[u8]>, code: &str) -> BsonResult<()> {
        self.append_string_base(BsonType::Code, key.as_ref(), code.as_bytes())
    }

    pub fn append_code_with_scope(
        &mut self,
        key: impl AsRef<[u8]>,
        code: &str,
        scope: RawDoc<'_>,
    ) -> BsonResult<()> {
        if self.finished {
            return Err(BsonError::AlreadyFinished);
        }
        let scope_bytes = scope.as_bytes();
        let total = 4 + 4 + code.len() + 1 + scope_bytes.len();
        self.append_estart(BsonType::CodeWithScope, key.as_ref(), total)?;
        self.put_i32(total as i32);
        self.put_string(code.as_bytes());
        self.data.extend_from_slice(scope_bytes);
        Ok(())
    }

    pub fn append_binary(
        &mut self,
        key: impl AsRef<[u8]>,
        kind: u8,
        data: &[u8],
    ) -> BsonResult<()> {
        let key = key.as_ref();
        if kind == subtype::BINARY_OLD {
            self.append_estart(BsonType::Binary, key, 4 + 1 + 4 + data.len())?;
            self.put_i32(data.len() as i32 + 4);
            self.data.push(kind);
            self.put_i32(data.len() as i32);
        } else {
            self.append_estart(BsonType::Binary, key, 4 + 1 + data.len())?;
            self.put_i32(data.len() as i32);
            self.data.push(kind);
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    pub fn append_regex(
        &mut self,
        key: impl AsRef<[u8]>,
        pattern: &str,
        options: &str,
    ) -> BsonResult<()> {
        if self.finished {
            return Err(BsonError::AlreadyFinished);
        }
        self.check_cstring(pattern.as_bytes(), "regex pattern")?;
        self.check_cstring(options.as_bytes(), "regex options")?;
        self.append_estart(
            BsonType::Regex,
            key.as_ref(),
            pattern.len() + 1 + options.len() + 1,
        )?;
        self.put_cstring(pattern.as_bytes());
        self.put_cstring(options.as_bytes());
        Ok(())
    }

    pub fn append_db_pointer(
        &mut self,
        key: impl AsRef<[u8]>,
        ns: &str,
        oid: &Oid,
    ) -> BsonResult<()> {
        if self.finished {
            return Err(BsonError::AlreadyFinished);
        }
        self.check_utf8(ns.as_bytes(), "db pointer namespace")?;
        self.append_estart(BsonType::DbRef, key.as_ref(), 4 + ns.len() + 1 + 12)?;
        self.put_string(ns.as_bytes());
        self.data.extend_from_slice(oid.bytes());
        Ok(())
    }

    /// Embeds a finished document as an object value.
    pub fn append_document(&mut self, key: impl AsRef<[u8]>, doc: RawDoc<'_>) -> BsonResult<()> {
        self.append_embedded(BsonType::Object, key.as_ref(), doc)
    }

    /// Embeds a finished document as an array value. Its keys are
    /// copied as-is.
    pub fn append_array(&mut self, key: impl AsRef<[u8]>, doc: RawDoc<'_>) -> BsonResult<()> {
        self.append_embedded(BsonType::Array, key.as_ref(), doc)
    }

    fn append_embedded(&mut self, kind: BsonType, key: &[u8], doc: RawDoc<'_>) -> BsonResult<()> {
        let bytes = doc.as_bytes();
        self.append_estart(kind, key, bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Copies an element read from another document, optionally under a
    /// new name.
    pub fn append_element(&mut self, name: Option<&str>, elem: &Element<'_>) -> BsonResult<()> {
        let key = match name {
            Some(name) => name.as_bytes(),
            None => elem.key_bytes(),
        };
        let value = elem.value_bytes();
        self.append_estart(elem.kind(), key, value.len())?;
        self.data.extend_from_slice(value);
        Ok(())
    }

    pub fn append_value(&mut self, key: impl AsRef<[u8]>, value: &Value<'_>) -> BsonResult<()> {
        let key = key.as_ref();
        match *value {
            Value::Double(v) => self.append_double(key, v),
            Value::String(s) => self.append_string(key, s),
            Value::Document(doc) => self.append_document(key, doc),
            Value::Array(doc) => self.append_array(key, doc),
            Value::Binary { subtype, data } => self.append_binary(key, subtype, data),
            Value::Undefined => self.append_undefined(key),
            Value::Oid(oid) => self.append_oid(key, &oid),
            Value::Bool(v) => self.append_bool(key, v),
            Value::Date(ms) => self.append_date(key, ms),
            Value::Null => self.append_null(key),
            Value::Regex { pattern, options } => self.append_regex(key, pattern, options),
            Value::DbPointer { ns, oid } => self.append_db_pointer(key, ns, &oid),
            Value::Code(code) => self.append_code(key, code),
            Value::Symbol(s) => self.append_symbol(key, s),
            Value::CodeWithScope { code, scope } => self.append_code_with_scope(key, code, scope),
            Value::Int(v) => self.append_int(key, v),
            Value::Timestamp(ts) => self.append_timestamp(key, ts),
            Value::Long(v) => self.append_long(key, v),
            Value::MinKey => self.append_minkey(key),
            Value::MaxKey => self.append_maxkey(key),
        }
    }

    fn begin_nested(&mut self, kind: BsonType, key: &[u8]) -> BsonResult<()> {
        if self.finished {
            return Err(BsonError::AlreadyFinished);
        }
        if self.stack.len() >= self.config.max_depth {
            return Err(BsonError::NestingTooDeep(self.stack.len() + 1));
        }
        self.append_estart(kind, key, 5)?;
        self.stack.push(self.data.len());
        self.put_i32(0);
        Ok(())
    }

    pub fn begin_object(&mut self, key: impl AsRef<[u8]>) -> BsonResult<()> {
        self.begin_nested(BsonType::Object, key.as_ref())
    }

    pub fn begin_array(&mut self, key: impl AsRef<[u8]>) -> BsonResult<()> {
        self.begin_nested(BsonType::Array, key.as_ref())
    }

    /// Closes the innermost open object or array.
    pub fn finish_object(&mut self) -> BsonResult<()> {
        if self.finished {
            return Err(BsonError::AlreadyFinished);
        }
        let start = self.stack.pop().ok_or(BsonError::NotNested)?;
        self.ensure_space(1)?;
        self.data.push(0);
        let len = (self.data.len() - start) as i32;
        self.data[start..start + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    pub fn finish_array(&mut self) -> BsonResult<()> {
        self.finish_object()
    }
}

impl Default for Bson {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Bson {
    fn eq(&self, other: &Self) -> bool {
        self.finished == other.finished && self.data == other.data
    }
}

impl fmt::Debug for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.finished {
            write!(f, "Bson({})", self.view().to_json())
        } else {
            f.debug_struct("Bson")
                .field("size", &self.data.len())
                .field("depth", &self.stack.len())
                .field("flags", &self.flags)
                .finish()
        }
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.view(), f)
    }
}
