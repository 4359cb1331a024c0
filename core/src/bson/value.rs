use super::iter::{Element, RawDoc};
use super::oid::Oid;
use super::types::{BsonType, Timestamp};

/// A typed element value borrowing from its source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Double(f64),
    String(&'a str),
    Document(RawDoc<'a>),
    Array(RawDoc<'a>),
    Binary { subtype: u8, data: &'a [u8] },
    Undefined,
    Oid(Oid),
    Bool(bool),
    Date(i64),
    Null,
    Regex { pattern: &'a str, options: &'a str },
    DbPointer { ns: &'a str, oid: Oid },
    Code(&'a str),
    Symbol(&'a str),
    CodeWithScope { code: &'a str, scope: RawDoc<'a> },
    Int(i32),
    Timestamp(Timestamp),
    Long(i64),
    MinKey,
    MaxKey,
}

impl Value<'_> {
    pub fn kind(&self) -> BsonType {
        match self {
            Value::Double(_) => BsonType::Double,
            Value::String(_) => BsonType::String,
            Value::Document(_) => BsonType::Object,
            Value::Array(_) => BsonType::Array,
            Value::Binary { .. } => BsonType::Binary,
            Value::Undefined => BsonType::Undefined,
            Value::Oid(_) => BsonType::Oid,
            Value::Bool(_) => BsonType::Bool,
            Value::Date(_) => BsonType::Date,
            Value::Null => BsonType::Null,
            Value::Regex { .. } => BsonType::Regex,
            Value::DbPointer { .. } => BsonType::DbRef,
            Value::Code(_) => BsonType::Code,
            Value::Symbol(_) => BsonType::Symbol,
            Value::CodeWithScope { .. } => BsonType::CodeWithScope,
            Value::Int(_) => BsonType::Int,
            Value::Timestamp(_) => BsonType::Timestamp,
            Value::Long(_) => BsonType::Long,
            Value::MinKey => BsonType::MinKey,
            Value::MaxKey => BsonType::MaxKey,
        }
    }
}

impl<'a> Element<'a> {
    /// Decodes the element into a typed value.
    pub fn value(&self) -> Value<'a> {
        match self.kind() {
            BsonType::Eoo | BsonType::Null => Value::Null,
            BsonType::Double => Value::Double(self.as_f64()),
            BsonType::String => Value::String(self.as_str()),
            BsonType::Object => Value::Document(self.as_document()),
            BsonType::Array => Value::Array(self.as_document()),
            BsonType::Binary => Value::Binary {
                subtype: self.bin_subtype(),
                data: self.bin_data(),
            },
            BsonType::Undefined => Value::Undefined,
            BsonType::Oid => Value::Oid(self.as_oid()),
            BsonType::Bool => Value::Bool(self.as_bool()),
            BsonType::Date => Value::Date(self.as_date()),
            BsonType::Regex => Value::Regex {
                pattern: self.regex(),
                options: self.regex_options(),
            },
            BsonType::DbRef => Value::DbPointer {
                ns: self.db_pointer_ns(),
                oid: self.as_oid(),
            },
            BsonType::Code => Value::Code(self.code()),
            BsonType::Symbol => Value::Symbol(self.as_str()),
            BsonType::CodeWithScope => Value::CodeWithScope {
                code: self.code(),
                scope: self.code_scope(),
            },
            BsonType::Int => Value::Int(self.as_i32()),
            BsonType::Timestamp => Value::Timestamp(self.as_timestamp()),
            BsonType::Long => Value::Long(self.as_i64()),
            BsonType::MinKey => Value::MinKey,
            BsonType::MaxKey => Value::MaxKey,
        }
    }
}

impl From<f64> for Value<'_> {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i32> for Value<'_> {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value<'_> {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<bool> for Value<'_> {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<'a> From<&'a str> for Value<'a> {
    fn from(v: &'a str) -> Self {
        Value::String(v)
    }
}

impl From<Oid> for Value<'_> {
    fn from(v: Oid) -> Self {
        Value::Oid(v)
    }
}

impl From<Timestamp> for Value<'_> {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}
