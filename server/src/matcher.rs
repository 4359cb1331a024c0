//! Query matching and ordering over stored documents

use docwire_core::{Bson, BsonResult, BsonType, Element, RawDoc};
use std::cmp::Ordering;

/// A query split out of its optional `$query`/`query` wrapper.
#[derive(Debug, Clone, Copy)]
pub struct QuerySpec<'a> {
    pub filter: RawDoc<'a>,
    pub orderby: Option<RawDoc<'a>>,
}

impl<'a> QuerySpec<'a> {
    pub fn parse(query: RawDoc<'a>) -> Self {
        let wrapped = query
            .find("$query")
            .or_else(|| query.find("query"))
            .filter(|e| e.kind() == BsonType::Object);
        match wrapped {
            Some(filter) => Self {
                filter: filter.as_document(),
                orderby: query
                    .find("$orderby")
                    .or_else(|| query.find("orderby"))
                    .filter(|e| e.kind() == BsonType::Object)
                    .map(|e| e.as_document()),
            },
            None => Self {
                filter: query,
                orderby: None,
            },
        }
    }
}

fn type_rank(kind: BsonType) -> u8 {
    match kind {
        BsonType::MinKey => 0,
        BsonType::Null | BsonType::Undefined | BsonType::Eoo => 1,
        BsonType::Double | BsonType::Int | BsonType::Long => 2,
        BsonType::String | BsonType::Symbol => 3,
        BsonType::Object => 4,
        BsonType::Array => 5,
        BsonType::Binary => 6,
        BsonType::Oid => 7,
        BsonType::Bool => 8,
        BsonType::Date | BsonType::Timestamp => 9,
        BsonType::Regex => 10,
        _ => 11,
    }
}

/// Orders two values of comparable types. Values of different kinds
/// that are not both numeric do not compare.
pub fn compare(a: &Element<'_>, b: &Element<'_>) -> Option<Ordering> {
    if a.kind().is_numeric() && b.kind().is_numeric() {
        return a.as_f64().partial_cmp(&b.as_f64());
    }
    if type_rank(a.kind()) != type_rank(b.kind()) {
        return None;
    }
    match a.kind() {
        BsonType::String | BsonType::Symbol => Some(a.as_str().cmp(b.as_str())),
        BsonType::Oid => Some(a.as_oid().cmp(&b.as_oid())),
        BsonType::Bool => Some(a.as_bool().cmp(&b.as_bool())),
        BsonType::Date => Some(a.as_date().cmp(&b.as_date())),
        BsonType::Null | BsonType::Undefined | BsonType::MinKey | BsonType::MaxKey => {
            Some(Ordering::Equal)
        }
        _ if a.value_bytes() == b.value_bytes() => Some(Ordering::Equal),
        _ => None,
    }
}

pub fn values_equal(a: &Element<'_>, b: &Element<'_>) -> bool {
    compare(a, b) == Some(Ordering::Equal)
}

/// Total order used for sorting: missing fields first, then by type rank,
/// then by value.
fn sort_order(a: Option<&Element<'_>>, b: Option<&Element<'_>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(a, b).unwrap_or_else(|| {
            type_rank(a.kind())
                .cmp(&type_rank(b.kind()))
                .then_with(|| a.value_bytes().cmp(b.value_bytes()))
        }),
    }
}

fn is_operator_doc(doc: RawDoc<'_>) -> bool {
    doc.iter().next().is_some_and(|e| e.key().starts_with('$'))
}

/// Whether `doc` satisfies every condition in `filter`. Unknown operators
/// are errors.
pub fn matches(doc: RawDoc<'_>, filter: RawDoc<'_>) -> Result<bool, String> {
    for cond in filter.iter() {
        let field = doc.find_path(cond.key());
        let ok = if cond.kind() == BsonType::Object && is_operator_doc(cond.as_document()) {
            let mut all = true;
            for op in cond.as_document().iter() {
                if !apply_operator(field.as_ref(), &op)? {
                    all = false;
                    break;
                }
            }
            all
        } else {
            match &field {
                Some(f) => values_equal(f, &cond) || array_contains(f, &cond),
                None => cond.is_null(),
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn array_contains(field: &Element<'_>, value: &Element<'_>) -> bool {
    field.kind() == BsonType::Array && field.as_document().iter().any(|e| values_equal(&e, value))
}

fn apply_operator(field: Option<&Element<'_>>, op: &Element<'_>) -> Result<bool, String> {
    let ordered = |want: fn(Ordering) -> bool| field.and_then(|f| compare(f, op)).is_some_and(want);
    let result = match op.key() {
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$ne" => match field {
            Some(f) => !values_equal(f, op),
            None => !op.is_null(),
        },
        "$in" | "$nin" => {
            if op.kind() != BsonType::Array {
                return Err(format!("{} needs an array", op.key()));
            }
            let found = field.is_some_and(|f| {
                op.as_document()
                    .iter()
                    .any(|candidate| values_equal(f, &candidate) || array_contains(f, &candidate))
            });
            if op.key() == "$in" { found } else { !found }
        }
        "$exists" => field.is_some() == op.as_bool(),
        other => return Err(format!("invalid operator: {}", other)),
    };
    Ok(result)
}

/// Sorts documents by an `{field: 1 | -1, ...}` specification.
pub fn sort_documents(docs: &mut [Bson], orderby: RawDoc<'_>) {
    let keys: Vec<(String, bool)> = orderby
        .iter()
        .map(|e| (e.key().to_string(), e.as_f64() >= 0.0))
        .collect();
    docs.sort_by(|a, b| {
        let (a, b) = (a.view(), b.view());
        for (key, ascending) in &keys {
            let ord = sort_order(a.find_path(key).as_ref(), b.find_path(key).as_ref());
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Applies a field selection. Listing fields with a true value keeps only
/// those (and `_id` unless excluded); listing only false values drops
/// them.
pub fn project(doc: RawDoc<'_>, fields: RawDoc<'_>) -> BsonResult<Bson> {
    if fields.is_empty() {
        return Ok(Bson::from_raw(doc));
    }
    let inclusive = fields.iter().any(|e| e.key() != "_id" && e.as_bool());
    let id_excluded = fields.find("_id").is_some_and(|e| !e.as_bool());

    let mut out = Bson::new();
    for elem in doc.iter() {
        let listed = fields.find(elem.key());
        let keep = if elem.key() == "_id" {
            !id_excluded
        } else if inclusive {
            listed.is_some_and(|e| e.as_bool())
        } else {
            listed.is_none()
        };
        if keep {
            out.append_element(None, &elem)?;
        }
    }
    out.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwire_core::notation::build;
    use docwire_core::{Token, Value};

    fn sample() -> Bson {
        build(&[
            Token::from("a"),
            Token::from(5),
            Token::from("b"),
            Token::from("x"),
            Token::from("tags"),
            Token::OpenArray,
            Token::from("red"),
            Token::from("blue"),
            Token::CloseArray,
        ])
        .unwrap()
    }

    fn check(doc: &Bson, query: &[Token<'_>]) -> bool {
        matches(doc.view(), build(query).unwrap().view()).unwrap()
    }

    #[test]
    fn test_equality_and_operators() {
        let d = sample();
        assert!(check(&d, &["a".into(), 5.0.into()]));
        assert!(check(
            &d,
            &["a".into(), Token::OpenDoc, "$gt".into(), 4.into(), "$lte".into(), 5i64.into(), Token::CloseDoc]
        ));
        assert!(!check(&d, &["a".into(), Token::OpenDoc, "$lt".into(), 5.into(), Token::CloseDoc]));
        assert!(check(&d, &["b".into(), Token::OpenDoc, "$ne".into(), "y".into(), Token::CloseDoc]));
        assert!(check(
            &d,
            &[
                "b".into(),
                Token::OpenDoc,
                "$in".into(),
                Token::OpenArray,
                "x".into(),
                "z".into(),
                Token::CloseArray,
                Token::CloseDoc
            ]
        ));
        assert!(check(&d, &["tags".into(), "blue".into()]));
        assert!(check(&d, &["c".into(), Token::OpenDoc, "$exists".into(), false.into(), Token::CloseDoc]));
        assert!(!check(&d, &["a".into(), Token::OpenDoc, "$exists".into(), false.into(), Token::CloseDoc]));
        assert!(check(&d, &["c".into(), Token::Value(Value::Null)]));

        let bad = build(&["a".into(), Token::OpenDoc, "$near".into(), 1.into(), Token::CloseDoc]).unwrap();
        assert!(matches(d.view(), bad.view()).is_err());
    }

    #[test]
    fn test_wrapped_query_and_sort() {
        let q = build(&[
            "$query".into(),
            Token::OpenDoc,
            Token::CloseDoc,
            "$orderby".into(),
            Token::OpenDoc,
            "a".into(),
            (-1).into(),
            Token::CloseDoc,
        ])
        .unwrap();
        let spec = QuerySpec::parse(q.view());
        assert!(spec.filter.is_empty());
        let orderby = spec.orderby.unwrap();

        let mut docs: Vec<Bson> = [1, 3, 2]
            .iter()
            .map(|&n| build(&["a".into(), n.into()]).unwrap())
            .collect();
        sort_documents(&mut docs, orderby);
        let order: Vec<i64> = docs.iter().map(|d| d.find("a").unwrap().as_i64()).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_projection() {
        let d = build(&["_id".into(), 1.into(), "a".into(), 2.into(), "b".into(), 3.into()]).unwrap();
        let only_a = project(d.view(), build(&["a".into(), 1.into()]).unwrap().view()).unwrap();
        assert_eq!(only_a.view().keys().collect::<Vec<_>>(), vec!["_id", "a"]);
        let no_b = project(
            d.view(),
            build(&["b".into(), 0.into(), "_id".into(), 0.into()]).unwrap().view(),
        )
        .unwrap();
        assert_eq!(no_b.view().keys().collect::<Vec<_>>(), vec!["a"]);
    }
}
