//! Human-readable dumps and JSON conversion

use super::iter::RawDoc;
use super::types::BsonType;
use serde_json::{Map, Number, Value as JsonValue, json};
use std::fmt;

impl RawDoc<'_> {
    /// Writes one line per element, indenting nested documents by depth.
    pub fn write_indented(&self, f: &mut impl fmt::Write, depth: usize) -> fmt::Result {
        for elem in self.iter() {
            for _ in 0..depth {
                f.write_char('\t')?;
            }
            write!(f, "{} : {} \t ", elem.key(), elem.kind() as u8)?;
            match elem.kind() {
                BsonType::Double => write!(f, "{:.6}", elem.as_f64())?,
                BsonType::String => write!(f, "{}", elem.as_str())?,
                BsonType::Symbol => write!(f, "SYMBOL: {}", elem.as_str())?,
                BsonType::Oid => write!(f, "{}", elem.as_oid())?,
                BsonType::Bool => write!(f, "{}", elem.as_bool())?,
                BsonType::Date => write!(f, "{}", elem.as_date())?,
                BsonType::Binary => write!(f, "BSON_BINDATA")?,
                BsonType::Undefined => write!(f, "BSON_UNDEFINED")?,
                BsonType::Null => write!(f, "BSON_NULL")?,
                BsonType::Regex => write!(f, "BSON_REGEX: {}", elem.regex())?,
                BsonType::Code => write!(f, "BSON_CODE: {}", elem.code())?,
                BsonType::CodeWithScope => {
                    writeln!(f, "BSON_CODE_W_SCOPE: {}", elem.code())?;
                    write!(f, "\t SCOPE: ")?;
                    elem.code_scope().write_indented(f, depth + 1)?;
                }
                BsonType::Int => write!(f, "{}", elem.as_i32())?,
                BsonType::Long => write!(f, "{}", elem.as_i64())?,
                BsonType::Timestamp => {
                    let ts = elem.as_timestamp();
                    write!(f, "i: {}, t: {}", ts.increment, ts.seconds)?
                }
                BsonType::DbRef => {
                    write!(f, "BSON_DBREF: {} {}", elem.db_pointer_ns(), elem.as_oid())?
                }
                BsonType::MinKey => write!(f, "BSON_MINKEY")?,
                BsonType::MaxKey => write!(f, "BSON_MAXKEY")?,
                BsonType::Object | BsonType::Array => {
                    writeln!(f)?;
                    elem.as_document().write_indented(f, depth + 1)?;
                    continue;
                }
                BsonType::Eoo => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }

    /// Converts to JSON using extended-JSON style wrappers for types
    /// JSON has no literal for.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for elem in self.iter() {
            map.insert(elem.key().to_string(), element_to_json(&elem));
        }
        JsonValue::Object(map)
    }
}

fn element_to_json(elem: &super::Element<'_>) -> JsonValue {
    match elem.kind() {
        BsonType::Double => Number::from_f64(elem.as_f64())
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        BsonType::String | BsonType::Symbol => JsonValue::String(elem.as_str().to_string()),
        BsonType::Object => elem.as_document().to_json(),
        BsonType::Array => JsonValue::Array(
            elem.as_document()
                .iter()
                .map(|e| element_to_json(&e))
                .collect(),
        ),
        BsonType::Binary => json!({
            "$binary": hex::encode(elem.bin_data()),
            "$type": elem.bin_subtype(),
        }),
        BsonType::Oid => json!({ "$oid": elem.as_oid().to_hex() }),
        BsonType::Bool => JsonValue::Bool(elem.as_bool()),
        BsonType::Date => json!({ "$date": elem.as_date() }),
        BsonType::Regex => json!({
            "$regex": elem.regex(),
            "$options": elem.regex_options(),
        }),
        BsonType::DbRef => json!({
            "$ref": elem.db_pointer_ns(),
            "$id": elem.as_oid().to_hex(),
        }),
        BsonType::Code => json!({ "$code": elem.code() }),
        BsonType::CodeWithScope => json!({
            "$code": elem.code(),
            "$scope": elem.code_scope().to_json(),
        }),
        BsonType::Int => JsonValue::from(elem.as_i32()),
        BsonType::Long => JsonValue::from(elem.as_i64()),
        BsonType::Timestamp => {
            let ts = elem.as_timestamp();
            json!({ "$timestamp": { "t": ts.seconds, "i": ts.increment } })
        }
        BsonType::MinKey => json!({ "$minKey": 1 }),
        BsonType::MaxKey => json!({ "$maxKey": 1 }),
        BsonType::Undefined => json!({ "$undefined": true }),
        BsonType::Eoo | BsonType::Null => JsonValue::Null,
    }
}

impl fmt::Display for RawDoc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}
