use lazy_static::lazy_static;
use std::borrow::Cow;

/// Indices with a precomputed key.
pub const INDEX_TABLE_LEN: usize = 1000;

lazy_static! {
    static ref INDEX_KEYS: Vec<String> = (0..INDEX_TABLE_LEN).map(|i| i.to_string()).collect();
}

/// Decimal key for an array index.
pub fn index_key(index: usize) -> Cow<'static, str> {
    match INDEX_KEYS.get(index) {
        Some(key) => Cow::Borrowed(key.as_str()),
        None => Cow::Owned(index.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_keys() {
        assert_eq!(index_key(0), "0");
        assert_eq!(index_key(42), "42");
        assert_eq!(index_key(999), "999");
        assert!(matches!(index_key(999), Cow::Borrowed(_)));
        assert_eq!(index_key(1000), "1000");
        assert!(matches!(index_key(1000), Cow::Owned(_)));
    }
}
