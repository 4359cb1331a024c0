//! Wire message layouts
//!
//! Every message starts with a 16-byte header of four little-endian
//! int32s: total length, request id, the id being answered, and opcode.

use crate::bson::RawDoc;
use crate::{DocWireError, DocWireResult};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

pub const HEADER_LEN: usize = 16;
/// flags, cursor id, starting index, document count
pub const REPLY_FIELDS_LEN: usize = 20;
pub const MAX_REPLY_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn from_i32(op: i32) -> Option<Self> {
        match op {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }
}

pub mod query_flags {
    pub const TAILABLE: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const OPLOG_REPLAY: i32 = 1 << 3;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;
}

pub mod update_flags {
    pub const UPSERT: i32 = 1 << 0;
    pub const MULTI: i32 = 1 << 1;
}

pub mod insert_flags {
    pub const CONTINUE_ON_ERROR: i32 = 1 << 0;
}

pub mod delete_flags {
    pub const SINGLE_REMOVE: i32 = 1 << 0;
}

pub mod reply_flags {
    pub const CURSOR_NOT_FOUND: i32 = 1 << 0;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: i32 = 1 << 2;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub len: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op: i32,
}

impl MsgHeader {
    pub fn decode(bytes: &[u8]) -> DocWireResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(DocWireError::ReadSize(bytes.len()));
        }
        let mut fields = [0i32; 4];
        for (i, field) in fields.iter_mut().enumerate() {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *field = i32::from_le_bytes(raw);
        }
        Ok(Self {
            len: fields[0],
            request_id: fields[1],
            response_to: fields[2],
            op: fields[3],
        })
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.len);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op);
    }

    pub fn op_code(&self) -> Option<OpCode> {
        OpCode::from_i32(self.op)
    }

    /// Bytes following the header, or an error for a length outside
    /// what a peer may send.
    pub fn body_len(&self, max: usize) -> DocWireResult<usize> {
        let len = usize::try_from(self.len).map_err(|_| DocWireError::ReadSize(0))?;
        if len < HEADER_LEN || len > max {
            return Err(DocWireError::ReadSize(len));
        }
        Ok(len - HEADER_LEN)
    }
}

/// Client-to-server messages
#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    Insert {
        flags: i32,
        ns: &'a str,
        documents: Vec<RawDoc<'a>>,
    },
    Update {
        ns: &'a str,
        flags: i32,
        selector: RawDoc<'a>,
        update: RawDoc<'a>,
    },
    Delete {
        ns: &'a str,
        flags: i32,
        selector: RawDoc<'a>,
    },
    Query {
        flags: i32,
        ns: &'a str,
        skip: i32,
        limit: i32,
        query: RawDoc<'a>,
        fields: Option<RawDoc<'a>>,
    },
    GetMore {
        ns: &'a str,
        limit: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl<'a> Request<'a> {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Insert { .. } => OpCode::Insert,
            Request::Update { .. } => OpCode::Update,
            Request::Delete { .. } => OpCode::Delete,
            Request::Query { .. } => OpCode::Query,
            Request::GetMore { .. } => OpCode::GetMore,
            Request::KillCursors { .. } => OpCode::KillCursors,
        }
    }

    /// Encodes the full message, header included.
    pub fn encode(&self, request_id: i32) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        MsgHeader {
            len: 0,
            request_id,
            response_to: 0,
            op: self.op_code() as i32,
        }
        .put(&mut buf);

        match self {
            Request::Insert {
                flags,
                ns,
                documents,
            } => {
                buf.put_i32_le(*flags);
                put_cstring(&mut buf, ns);
                for doc in documents {
                    buf.put_slice(doc.as_bytes());
                }
            }
            Request::Update {
                ns,
                flags,
                selector,
                update,
            } => {
                buf.put_i32_le(0);
                put_cstring(&mut buf, ns);
                buf.put_i32_le(*flags);
                buf.put_slice(selector.as_bytes());
                buf.put_slice(update.as_bytes());
            }
            Request::Delete {
                ns,
                flags,
                selector,
            } => {
                buf.put_i32_le(0);
                put_cstring(&mut buf, ns);
                buf.put_i32_le(*flags);
                buf.put_slice(selector.as_bytes());
            }
            Request::Query {
                flags,
                ns,
                skip,
                limit,
                query,
                fields,
            } => {
                buf.put_i32_le(*flags);
                put_cstring(&mut buf, ns);
                buf.put_i32_le(*skip);
                buf.put_i32_le(*limit);
                buf.put_slice(query.as_bytes());
                if let Some(fields) = fields {
                    buf.put_slice(fields.as_bytes());
                }
            }
            Request::GetMore {
                ns,
                limit,
                cursor_id,
            } => {
                buf.put_i32_le(0);
                put_cstring(&mut buf, ns);
                buf.put_i32_le(*limit);
                buf.put_i64_le(*cursor_id);
            }
            Request::KillCursors { cursor_ids } => {
                buf.put_i32_le(0);
                buf.put_i32_le(cursor_ids.len() as i32);
                for id in cursor_ids {
                    buf.put_i64_le(*id);
                }
            }
        }

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());
        buf.freeze()
    }

    /// Parses a message body (the bytes after the header).
    pub fn decode(op: OpCode, body: &'a [u8]) -> DocWireResult<Self> {
        let mut reader = BodyReader { body, pos: 0 };
        let request = match op {
            OpCode::Insert => {
                let flags = reader.i32()?;
                let ns = reader.cstring()?;
                let mut documents = Vec::new();
                while !reader.is_empty() {
                    documents.push(reader.document()?);
                }
                Request::Insert {
                    flags,
                    ns,
                    documents,
                }
            }
            OpCode::Update => {
                reader.i32()?;
                let ns = reader.cstring()?;
                let flags = reader.i32()?;
                let selector = reader.document()?;
                let update = reader.document()?;
                Request::Update {
                    ns,
                    flags,
                    selector,
                    update,
                }
            }
            OpCode::Delete => {
                reader.i32()?;
                let ns = reader.cstring()?;
                let flags = reader.i32()?;
                let selector = reader.document()?;
                Request::Delete {
                    ns,
                    flags,
                    selector,
                }
            }
            OpCode::Query => {
                let flags = reader.i32()?;
                let ns = reader.cstring()?;
                let skip = reader.i32()?;
                let limit = reader.i32()?;
                let query = reader.document()?;
                let fields = if reader.is_empty() {
                    None
                } else {
                    Some(reader.document()?)
                };
                Request::Query {
                    flags,
                    ns,
                    skip,
                    limit,
                    query,
                    fields,
                }
            }
            OpCode::GetMore => {
                reader.i32()?;
                let ns = reader.cstring()?;
                let limit = reader.i32()?;
                let cursor_id = reader.i64()?;
                Request::GetMore {
                    ns,
                    limit,
                    cursor_id,
                }
            }
            OpCode::KillCursors => {
                reader.i32()?;
                let count = reader.i32()?.max(0) as usize;
                let mut cursor_ids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    cursor_ids.push(reader.i64()?);
                }
                Request::KillCursors { cursor_ids }
            }
            OpCode::Reply => {
                return Err(DocWireError::Protocol(
                    "reply opcode sent as a request".into(),
                ));
            }
        };
        Ok(request)
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

struct BodyReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.body.len()
    }

    fn take(&mut self, n: usize) -> DocWireResult<&'a [u8]> {
        let bytes = self
            .body
            .get(self.pos..self.pos + n)
            .ok_or_else(|| DocWireError::Protocol("message body truncated".into()))?;
        self.pos += n;
        Ok(bytes)
    }

    fn i32(&mut self) -> DocWireResult<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    fn i64(&mut self) -> DocWireResult<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    fn cstring(&mut self) -> DocWireResult<&'a str> {
        let rest = &self.body[self.pos.min(self.body.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DocWireError::Protocol("unterminated namespace".into()))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|_| DocWireError::Protocol("namespace is not UTF-8".into()))?;
        self.pos += end + 1;
        Ok(s)
    }

    fn document(&mut self) -> DocWireResult<RawDoc<'a>> {
        let rest = &self.body[self.pos.min(self.body.len())..];
        let doc = RawDoc::from_bytes(rest)?;
        self.pos += doc.size();
        Ok(doc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyFields {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
}

/// A server reply: header, reply fields and the returned documents.
#[derive(Debug, Clone)]
pub struct Reply {
    pub header: MsgHeader,
    pub fields: ReplyFields,
    objects: Bytes,
}

impl Reply {
    /// Rejects total lengths outside `[header + fields, 64 MiB]`.
    pub fn check_size(len: usize) -> DocWireResult<()> {
        if !(HEADER_LEN + REPLY_FIELDS_LEN..=MAX_REPLY_SIZE).contains(&len) {
            warn!("rejecting reply of {} bytes", len);
            return Err(DocWireError::ReadSize(len));
        }
        Ok(())
    }

    /// Parses the bytes following the header.
    pub fn parse(header: MsgHeader, body: Bytes) -> DocWireResult<Self> {
        if body.len() < REPLY_FIELDS_LEN {
            return Err(DocWireError::ReadSize(HEADER_LEN + body.len()));
        }
        let mut reader = BodyReader {
            body: &body,
            pos: 0,
        };
        let fields = ReplyFields {
            flags: reader.i32()?,
            cursor_id: reader.i64()?,
            starting_from: reader.i32()?,
            number_returned: reader.i32()?,
        };
        Ok(Self {
            header,
            fields,
            objects: body.slice(REPLY_FIELDS_LEN..),
        })
    }

    pub fn encode(request_id: i32, response_to: i32, flags: i32, cursor_id: i64, starting_from: i32, documents: &[RawDoc<'_>]) -> Bytes {
        let body_len: usize = documents.iter().map(|d| d.size()).sum();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + REPLY_FIELDS_LEN + body_len);
        MsgHeader {
            len: (HEADER_LEN + REPLY_FIELDS_LEN + body_len) as i32,
            request_id,
            response_to,
            op: OpCode::Reply as i32,
        }
        .put(&mut buf);
        buf.put_i32_le(flags);
        buf.put_i64_le(cursor_id);
        buf.put_i32_le(starting_from);
        buf.put_i32_le(documents.len() as i32);
        for doc in documents {
            buf.put_slice(doc.as_bytes());
        }
        buf.freeze()
    }

    pub fn cursor_id(&self) -> i64 {
        self.fields.cursor_id
    }

    pub fn number_returned(&self) -> i32 {
        self.fields.number_returned
    }

    pub fn objects(&self) -> &[u8] {
        &self.objects
    }

    /// Document starting at `offset` within the returned objects.
    pub fn document_at(&self, offset: usize) -> DocWireResult<RawDoc<'_>> {
        let bytes = self
            .objects
            .get(offset..)
            .ok_or_else(|| DocWireError::Protocol(format!("offset {} past reply", offset)))?;
        Ok(RawDoc::from_bytes(bytes)?)
    }

    pub fn first(&self) -> Option<RawDoc<'_>> {
        self.documents().next()
    }

    pub fn documents(&self) -> ReplyDocuments<'_> {
        ReplyDocuments {
            objects: &self.objects,
            pos: 0,
        }
    }
}

/// Walks the documents of a reply until the end of the buffer or the
/// first malformed document.
pub struct ReplyDocuments<'a> {
    objects: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ReplyDocuments<'a> {
    type Item = RawDoc<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.objects.len() {
            return None;
        }
        match RawDoc::from_bytes(&self.objects[self.pos..]) {
            Ok(doc) => {
                self.pos += doc.size();
                Some(doc)
            }
            Err(e) => {
                warn!("malformed document in reply at offset {}: {}", self.pos, e);
                self.pos = self.objects.len();
                None
            }
        }
    }
}
