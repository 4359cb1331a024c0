/// Element type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BsonType {
    Eoo = 0x00,
    Double = 0x01,
    String = 0x02,
    Object = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    Oid = 0x07,
    Bool = 0x08,
    Date = 0x09,
    Null = 0x0A,
    Regex = 0x0B,
    DbRef = 0x0C,
    Code = 0x0D,
    Symbol = 0x0E,
    CodeWithScope = 0x0F,
    Int = 0x10,
    Timestamp = 0x11,
    Long = 0x12,
    MaxKey = 0x7F,
    MinKey = 0xFF,
}

impl BsonType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        let kind = match tag {
            0x00 => BsonType::Eoo,
            0x01 => BsonType::Double,
            0x02 => BsonType::String,
            0x03 => BsonType::Object,
            0x04 => BsonType::Array,
            0x05 => BsonType::Binary,
            0x06 => BsonType::Undefined,
            0x07 => BsonType::Oid,
            0x08 => BsonType::Bool,
            0x09 => BsonType::Date,
            0x0A => BsonType::Null,
            0x0B => BsonType::Regex,
            0x0C => BsonType::DbRef,
            0x0D => BsonType::Code,
            0x0E => BsonType::Symbol,
            0x0F => BsonType::CodeWithScope,
            0x10 => BsonType::Int,
            0x11 => BsonType::Timestamp,
            0x12 => BsonType::Long,
            0x7F => BsonType::MaxKey,
            0xFF => BsonType::MinKey,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, BsonType::Double | BsonType::Int | BsonType::Long)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BsonType::Eoo => "eoo",
            BsonType::Double => "double",
            BsonType::String => "string",
            BsonType::Object => "object",
            BsonType::Array => "array",
            BsonType::Binary => "binary",
            BsonType::Undefined => "undefined",
            BsonType::Oid => "oid",
            BsonType::Bool => "bool",
            BsonType::Date => "date",
            BsonType::Null => "null",
            BsonType::Regex => "regex",
            BsonType::DbRef => "dbref",
            BsonType::Code => "code",
            BsonType::Symbol => "symbol",
            BsonType::CodeWithScope => "code_w_scope",
            BsonType::Int => "int",
            BsonType::Timestamp => "timestamp",
            BsonType::Long => "long",
            BsonType::MaxKey => "maxkey",
            BsonType::MinKey => "minkey",
        }
    }
}

/// Binary subtypes
pub mod subtype {
    pub const GENERIC: u8 = 0x00;
    pub const FUNCTION: u8 = 0x01;
    /// Legacy subtype whose payload carries a second, inner length.
    pub const BINARY_OLD: u8 = 0x02;
    pub const UUID: u8 = 0x03;
    pub const MD5: u8 = 0x05;
    pub const USER_DEFINED: u8 = 0x80;
}

/// Replication timestamp. Encoded as the increment followed by the
/// seconds, each a little-endian 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub seconds: u32,
    pub increment: u32,
}

impl Timestamp {
    pub fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }
}

/// Flags collected while building a document. They describe the
/// document's content; whether they are fatal depends on where the
/// document is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidityFlags(u8);

impl ValidityFlags {
    pub const NONE: ValidityFlags = ValidityFlags(0);
    pub const NOT_UTF8: ValidityFlags = ValidityFlags(1 << 1);
    pub const FIELD_HAS_DOT: ValidityFlags = ValidityFlags(1 << 2);
    pub const FIELD_INIT_DOLLAR: ValidityFlags = ValidityFlags(1 << 3);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: ValidityFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(&self, other: ValidityFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: ValidityFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ValidityFlags {
    type Output = ValidityFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ValidityFlags(self.0 | rhs.0)
    }
}
