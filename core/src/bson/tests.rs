use super::*;
use crate::CodecConfig;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn sample_document() -> Bson {
    let mut scope = Bson::new();
    scope.append_int("x", 5).unwrap();
    scope.finish().unwrap();

    let mut b = Bson::new();
    b.append_double("d", 3.25).unwrap();
    b.append_string("s", "hello").unwrap();
    b.begin_object("o").unwrap();
    b.append_int("inner", 1).unwrap();
    b.begin_array("list").unwrap();
    b.append_string("0", "a").unwrap();
    b.append_string("1", "b").unwrap();
    b.finish_array().unwrap();
    b.finish_object().unwrap();
    b.append_binary("bin", subtype::GENERIC, &[1, 2, 3, 4]).unwrap();
    b.append_binary("old", subtype::BINARY_OLD, &[9, 8, 7]).unwrap();
    b.append_undefined("u").unwrap();
    b.append_oid("_id", &Oid::from_hex("4f3c1c8e2a1b3c4d5e6f7a8b").unwrap())
        .unwrap();
    b.append_bool("t", true).unwrap();
    b.append_date("when", 1_300_000_000_123).unwrap();
    b.append_null("n").unwrap();
    b.append_regex("re", "^ab+c$", "i").unwrap();
    b.append_code("c", "function() {}").unwrap();
    b.append_symbol("sym", "token").unwrap();
    b.append_code_with_scope("cws", "return x;", scope.raw().unwrap())
        .unwrap();
    b.append_int("i", -42).unwrap();
    b.append_timestamp("ts", Timestamp::new(1_300_000_000, 7)).unwrap();
    b.append_long("l", 1 << 40).unwrap();
    b.append_minkey("min").unwrap();
    b.append_maxkey("max").unwrap();
    b.finish().unwrap();
    b
}

#[test]
fn test_round_trip_is_byte_identical() {
    let original = sample_document();

    let mut copy = Bson::new();
    for elem in original.raw().unwrap().iter() {
        copy.append_value(elem.key(), &elem.value()).unwrap();
    }
    copy.finish().unwrap();

    assert_eq!(original.as_bytes(), copy.as_bytes());
}

#[test]
fn test_keys_keep_insertion_order() {
    let doc = sample_document();
    let keys: Vec<&str> = doc.raw().unwrap().keys().collect();
    assert_eq!(
        keys,
        vec![
            "d", "s", "o", "bin", "old", "u", "_id", "t", "when", "n", "re", "c", "sym", "cws",
            "i", "ts", "l", "min", "max"
        ]
    );
}

#[test]
fn test_typed_accessors() {
    let doc = sample_document();
    let raw = doc.raw().unwrap();

    assert_eq!(raw.find("d").unwrap().as_f64(), 3.25);
    assert_eq!(raw.find("s").unwrap().as_str(), "hello");
    assert_eq!(raw.find("s").unwrap().string_len(), 5);
    assert_eq!(raw.find("bin").unwrap().bin_data(), &[1, 2, 3, 4]);
    assert_eq!(raw.find("old").unwrap().bin_data(), &[9, 8, 7]);
    assert_eq!(raw.find("old").unwrap().bin_subtype(), subtype::BINARY_OLD);
    assert_eq!(raw.find("_id").unwrap().as_oid().to_hex(), "4f3c1c8e2a1b3c4d5e6f7a8b");
    assert_eq!(raw.find("when").unwrap().as_date(), 1_300_000_000_123);
    assert_eq!(raw.find("re").unwrap().regex(), "^ab+c$");
    assert_eq!(raw.find("re").unwrap().regex_options(), "i");
    assert_eq!(raw.find("c").unwrap().code(), "function() {}");
    assert_eq!(raw.find("sym").unwrap().as_str(), "token");
    assert_eq!(raw.find("cws").unwrap().code(), "return x;");
    assert_eq!(
        raw.find("cws").unwrap().code_scope().find("x").unwrap().as_i32(),
        5
    );
    assert!(raw.find("c").unwrap().code_scope().is_empty());
    assert_eq!(
        raw.find("ts").unwrap().as_timestamp(),
        Timestamp::new(1_300_000_000, 7)
    );
    assert_eq!(raw.find("l").unwrap().as_i64(), 1 << 40);
    assert_eq!(raw.find_path("o.list.1").unwrap().as_str(), "b");
    assert_eq!(raw.find_path("o.inner").unwrap().as_i32(), 1);
    assert!(raw.find_path("o.missing").is_none());
}

#[test]
fn test_numeric_coercion_and_defaults() {
    let mut b = Bson::new();
    b.append_double("d", 7.9).unwrap();
    b.append_int("i", 3).unwrap();
    b.append_long("l", 5_000_000_000).unwrap();
    b.append_string("s", "x").unwrap();
    b.finish().unwrap();
    let raw = b.raw().unwrap();

    assert_eq!(raw.find("d").unwrap().as_i32(), 7);
    assert_eq!(raw.find("i").unwrap().as_f64(), 3.0);
    assert_eq!(raw.find("i").unwrap().as_i64(), 3);
    assert_eq!(raw.find("l").unwrap().as_f64(), 5_000_000_000.0);

    let s = raw.find("s").unwrap();
    assert_eq!(s.as_i32(), 0);
    assert_eq!(s.as_date(), 0);
    assert_eq!(s.as_oid(), Oid::default());
    assert!(s.bin_data().is_empty());
    assert!(s.as_document().is_empty());
    assert_eq!(raw.find("i").unwrap().as_str(), "");
}

#[test]
fn test_bool_truthiness() {
    let mut b = Bson::new();
    b.append_int("zero", 0).unwrap();
    b.append_double("half", 0.5).unwrap();
    b.append_null("null").unwrap();
    b.append_undefined("undef").unwrap();
    b.append_string("str", "").unwrap();
    b.append_bool("no", false).unwrap();
    b.finish().unwrap();
    let raw = b.raw().unwrap();

    assert!(!raw.find("zero").unwrap().as_bool());
    assert!(raw.find("half").unwrap().as_bool());
    assert!(!raw.find("null").unwrap().as_bool());
    assert!(!raw.find("undef").unwrap().as_bool());
    assert!(raw.find("str").unwrap().as_bool());
    assert!(!raw.find("no").unwrap().as_bool());
}

#[test]
fn test_finish_is_idempotent() {
    let mut b = Bson::new();
    b.append_int("a", 1).unwrap();
    b.finish().unwrap();
    let bytes = b.as_bytes().to_vec();

    b.finish().unwrap();
    assert_eq!(b.as_bytes(), bytes.as_slice());
    assert_eq!(b.size(), 12);
}

#[test]
fn test_append_after_finish_fails_without_corruption() {
    let mut b = Bson::new();
    b.append_int("a", 1).unwrap();
    b.finish().unwrap();
    let bytes = b.as_bytes().to_vec();

    assert_eq!(b.append_int("b", 2), Err(BsonError::AlreadyFinished));
    assert_eq!(b.append_string("c", "x"), Err(BsonError::AlreadyFinished));
    assert_eq!(b.begin_object("d"), Err(BsonError::AlreadyFinished));
    assert_eq!(b.finish_object(), Err(BsonError::AlreadyFinished));
    assert_eq!(b.as_bytes(), bytes.as_slice());
}

#[test]
fn test_unclosed_nesting() {
    let mut b = Bson::new();
    b.begin_object("a").unwrap();
    b.begin_array("b").unwrap();
    assert_eq!(b.finish(), Err(BsonError::UnclosedNesting(2)));
    b.finish_array().unwrap();
    b.finish_object().unwrap();
    b.finish().unwrap();
    assert_eq!(b.finish_object(), Err(BsonError::AlreadyFinished));

    let mut b = Bson::new();
    assert_eq!(b.finish_object(), Err(BsonError::NotNested));
}

#[test]
fn test_nesting_limit() {
    let config = CodecConfig {
        max_depth: 3,
        ..CodecConfig::default()
    };
    let mut b = Bson::with_config(config);
    b.begin_object("a").unwrap();
    b.begin_object("b").unwrap();
    b.begin_array("c").unwrap();
    assert_eq!(b.begin_object("d"), Err(BsonError::NestingTooDeep(4)));
}

#[test]
fn test_invalid_utf8_blocks_finish() {
    let mut b = Bson::new();
    assert_eq!(
        b.append_string_bytes("bad", &[0x66, 0xff, 0x66]),
        Err(BsonError::InvalidUtf8("string value"))
    );
    assert!(b.flags().contains(ValidityFlags::NOT_UTF8));
    assert_eq!(b.finish(), Err(BsonError::InvalidUtf8("document")));
    assert!(!b.is_finished());

    let mut b = Bson::new();
    assert_eq!(
        b.append_key_bytes(&[0xc3, 0x28], "v"),
        Err(BsonError::InvalidUtf8("key"))
    );
    assert!(b.flags().contains(ValidityFlags::NOT_UTF8));
}

#[test]
fn test_interior_nul_rejected() {
    let mut b = Bson::new();
    assert_eq!(b.append_int("a\0b", 1), Err(BsonError::InteriorNul("key")));
    assert_eq!(
        b.append_regex("r", "a\0", ""),
        Err(BsonError::InteriorNul("regex pattern"))
    );
    b.finish().unwrap();
    assert!(b.raw().unwrap().is_empty());
}

#[test]
fn test_field_name_flags() {
    let mut b = Bson::new();
    b.append_string("$ref", "coll").unwrap();
    b.append_int("$id", 1).unwrap();
    b.append_string("$db", "test").unwrap();
    assert!(b.flags().is_empty());

    b.append_int("a.b", 1).unwrap();
    assert!(b.flags().contains(ValidityFlags::FIELD_HAS_DOT));
    assert!(!b.flags().contains(ValidityFlags::FIELD_INIT_DOLLAR));

    b.append_int("$set", 1).unwrap();
    assert!(b.flags().contains(ValidityFlags::FIELD_INIT_DOLLAR));
    b.finish().unwrap();
}

#[test]
fn test_buffer_growth() {
    let config = CodecConfig {
        initial_capacity: 8,
        ..CodecConfig::default()
    };
    let mut b = Bson::with_config(config);
    for i in 0..2000 {
        b.append_long(i.to_string(), i as i64).unwrap();
    }
    b.finish().unwrap();
    let raw = b.raw().unwrap();
    assert_eq!(raw.len(), 2000);
    assert_eq!(raw.find("1999").unwrap().as_i64(), 1999);
}

#[test]
fn test_append_element_and_document() {
    let src = sample_document();
    let raw = src.raw().unwrap();

    let mut b = Bson::new();
    b.append_element(None, &raw.find("s").unwrap()).unwrap();
    b.append_element(Some("renamed"), &raw.find("o").unwrap())
        .unwrap();
    b.append_document("whole", raw).unwrap();
    b.finish().unwrap();

    let out = b.raw().unwrap();
    assert_eq!(out.find("s").unwrap().as_str(), "hello");
    assert_eq!(out.find_path("renamed.inner").unwrap().as_i32(), 1);
    assert_eq!(out.find("whole").unwrap().as_document(), raw);
}

#[test]
fn test_empty_document() {
    let empty = Bson::empty();
    assert!(empty.is_finished());
    assert_eq!(empty.as_bytes(), &[5, 0, 0, 0, 0]);
    assert_eq!(empty.raw().unwrap().iter().count(), 0);

    let mut built = Bson::new();
    built.finish().unwrap();
    assert_eq!(built, empty);
}

#[test]
fn test_unfinished_view_is_empty() {
    let mut b = Bson::new();
    b.append_int("a", 1).unwrap();
    assert_eq!(b.raw().unwrap_err(), BsonError::NotFinished);
    assert!(b.view().is_empty());
}

#[test]
fn test_raw_doc_framing() {
    assert!(RawDoc::from_bytes(&[5, 0, 0]).is_err());
    assert!(RawDoc::from_bytes(&[4, 0, 0, 0, 0]).is_err());
    assert!(RawDoc::from_bytes(&[9, 0, 0, 0, 0]).is_err());
    assert!(RawDoc::from_bytes(&[5, 0, 0, 0, 1]).is_err());

    let doc = sample_document();
    let mut padded = doc.as_bytes().to_vec();
    padded.extend_from_slice(&[0xaa, 0xbb]);
    let raw = RawDoc::from_bytes(&padded).unwrap();
    assert_eq!(raw.size(), doc.size());
}

#[test]
fn test_corrupt_element_stops_iteration() {
    let mut b = Bson::new();
    b.append_int("a", 1).unwrap();
    b.append_string("s", "abc").unwrap();
    b.finish().unwrap();

    let mut bytes = b.as_bytes().to_vec();
    // string length prefix follows "\x02s\0"
    let len_at = 4 + 7 + 3;
    bytes[len_at..len_at + 4].copy_from_slice(&1000i32.to_le_bytes());

    let raw = RawDoc::from_bytes(&bytes).unwrap();
    let mut iter = raw.iter();
    assert_eq!(iter.next().unwrap().key(), "a");
    assert!(iter.next().is_none());
    assert!(iter.is_corrupt());
}

#[test]
fn test_value_offsets() {
    let mut b = Bson::new();
    b.append_int("a", 1).unwrap();
    b.append_int("bb", 2).unwrap();
    b.finish().unwrap();

    let offsets: Vec<usize> = b.raw().unwrap().iter().map(|e| e.value_offset()).collect();
    assert_eq!(offsets, vec![7, 15]);
}

#[test]
fn test_oid_hex() {
    let oid = Oid::from_hex("0123456789abcdef01234567").unwrap();
    assert_eq!(oid.to_hex(), "0123456789abcdef01234567");
    assert_eq!(oid.to_string(), "0123456789abcdef01234567");
    assert_eq!(oid.timestamp(), 0x01234567);
    assert_eq!(oid.counter(), 0x01234567);
    assert!(Oid::from_hex("0123").is_err());
    assert!(Oid::from_hex("zz23456789abcdef01234567").is_err());
    assert_eq!("0123456789ABCDEF01234567".parse::<Oid>().unwrap(), oid);
}

#[test]
fn test_oid_generation() {
    let generator = OidGenerator::with_fuzz(0xdeadbeef, 0);
    let mut seen = HashSet::new();
    let mut last_counter = None;

    for _ in 0..10_000 {
        let oid = generator.next_oid();
        assert!(seen.insert(oid));
        assert_eq!(oid.fuzz(), 0xdeadbeef);
        if let Some(last) = last_counter {
            assert!(oid.counter() > last);
        }
        last_counter = Some(oid.counter());
    }
    assert_eq!(seen.len(), 10_000);
}

#[test]
fn test_process_oids_are_distinct() {
    let a = Oid::generate();
    let b = Oid::generate();
    assert_ne!(a, b);
    assert!(b.counter() > a.counter());
    assert_eq!(a.fuzz(), b.fuzz());
    assert!(a.generation_time().is_some());
}

#[test]
fn test_fatal_hook_intercepts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let config = CodecConfig::default().with_fatal_hook(move |_msg| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let err = config.fatal("out of memory");
    assert_eq!(err, BsonError::Fatal("out of memory".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_json_conversion() {
    let mut b = Bson::new();
    b.append_string("name", "x").unwrap();
    b.append_int("n", 3).unwrap();
    b.begin_array("tags").unwrap();
    b.append_string("0", "a").unwrap();
    b.append_bool("1", true).unwrap();
    b.finish_array().unwrap();
    b.finish().unwrap();

    assert_eq!(
        b.raw().unwrap().to_json(),
        serde_json::json!({ "name": "x", "n": 3, "tags": ["a", true] })
    );
}

#[test]
fn test_display_dump() {
    let mut b = Bson::new();
    b.append_int("a", 1).unwrap();
    b.begin_object("o").unwrap();
    b.append_string("s", "v").unwrap();
    b.finish_object().unwrap();
    b.finish().unwrap();

    assert_eq!(b.to_string(), "a : 16 \t 1\no : 3 \t \n\ts : 2 \t v\n");
}
