//! In-memory document store
//!
//! Namespaces map to collections of finished documents kept in insertion
//! order. Every stored document gets a sequence number so tailable
//! cursors can resume after the last document they returned.

use crate::matcher::{self, QuerySpec};
use dashmap::DashMap;
use docwire_core::{Bson, BsonError, BsonType, Element, Oid, RawDoc};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

pub const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("E11000 duplicate key error index: {index}")]
    DuplicateKey { index: String },

    #[error("{0}")]
    BadQuery(String),

    #[error("{0}")]
    BadUpdate(String),

    #[error("collection already exists: {0}")]
    NamespaceExists(String),

    #[error("ns not found: {0}")]
    NamespaceNotFound(String),

    #[error("document error: {0}")]
    Bson(#[from] BsonError),
}

impl StoreError {
    pub fn code(&self) -> i32 {
        match self {
            StoreError::DuplicateKey { .. } => DUPLICATE_KEY_CODE,
            StoreError::BadQuery(_) => 2,
            StoreError::BadUpdate(_) => 9,
            StoreError::NamespaceExists(_) => 48,
            StoreError::NamespaceNotFound(_) => 26,
            StoreError::Bson(_) => 22,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CappedSpec {
    pub size: usize,
    pub max: usize,
}

#[derive(Debug, Clone)]
struct Stored {
    seq: u64,
    doc: Bson,
}

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Stored>,
    indexes: Vec<IndexSpec>,
    capped: Option<CappedSpec>,
}

impl Collection {
    fn data_size(&self) -> usize {
        self.docs.iter().map(|s| s.doc.size()).sum()
    }

    fn index_key<'d>(doc: RawDoc<'d>, index: &IndexSpec) -> Vec<Option<Element<'d>>> {
        index.keys.iter().map(|k| doc.find_path(k)).collect()
    }

    fn same_key(a: &[Option<Element<'_>>], b: &[Option<Element<'_>>]) -> bool {
        a.iter().zip(b).all(|(x, y)| match (x, y) {
            (None, None) => true,
            (Some(x), Some(y)) => matcher::values_equal(x, y),
            _ => false,
        })
    }

    /// Rejects `doc` if it collides with another document on a unique
    /// index. `skip` is the position being replaced, if any.
    fn check_unique(&self, doc: RawDoc<'_>, skip: Option<usize>) -> StoreResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = Self::index_key(doc, index);
            let clash = self.docs.iter().enumerate().any(|(i, other)| {
                Some(i) != skip && Self::same_key(&key, &Self::index_key(other.doc.view(), index))
            });
            if clash {
                return Err(StoreError::DuplicateKey {
                    index: index.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn trim_capped(&mut self) {
        let Some(capped) = self.capped else {
            return;
        };
        while capped.max > 0 && self.docs.len() > capped.max {
            self.docs.remove(0);
        }
        while capped.size > 0 && self.docs.len() > 1 && self.data_size() > capped.size {
            self.docs.remove(0);
        }
    }

    fn matching(&self, filter: RawDoc<'_>) -> StoreResult<Vec<usize>> {
        let mut out = Vec::new();
        for (i, stored) in self.docs.iter().enumerate() {
            if matcher::matches(stored.doc.view(), filter).map_err(StoreError::BadQuery)? {
                out.push(i);
            }
        }
        Ok(out)
    }
}

/// Result of an update, reported through `getlasterror`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub n: usize,
    pub updated_existing: bool,
    pub upserted: Option<Oid>,
}

#[derive(Debug, Default)]
pub struct Store {
    namespaces: DashMap<String, Collection>,
    next_seq: AtomicU64,
}

fn has_id(doc: RawDoc<'_>) -> bool {
    doc.find("_id").is_some()
}

/// Copies `doc` with a generated `_id` in front when it has none.
fn with_id(doc: RawDoc<'_>, id: Option<&Element<'_>>) -> StoreResult<(Bson, Option<Oid>)> {
    if has_id(doc) {
        return Ok((Bson::from_raw(doc), None));
    }
    let mut out = Bson::new();
    let generated = match id {
        Some(elem) => {
            out.append_element(Some("_id"), elem)?;
            None
        }
        None => Some(out.append_new_oid("_id")?),
    };
    for elem in doc.iter() {
        out.append_element(None, &elem)?;
    }
    out.finish()?;
    Ok((out, generated))
}

fn database_of(ns: &str) -> &str {
    ns.split_once('.').map_or(ns, |(db, _)| db)
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, ns: &str, doc: RawDoc<'_>) -> StoreResult<()> {
        let (doc, _) = with_id(doc, None)?;
        let mut coll = self.namespaces.entry(ns.to_string()).or_default();
        coll.check_unique(doc.view(), None)?;
        let seq = self.seq();
        coll.docs.push(Stored { seq, doc });
        coll.trim_capped();
        Ok(())
    }

    /// Registers an index described by a `system.indexes` document. A
    /// unique index over data that already has duplicates is refused.
    /// Returns whether the index is new.
    pub fn ensure_index(&self, spec: RawDoc<'_>) -> StoreResult<bool> {
        let ns = spec
            .find("ns")
            .map(|e| e.as_str().to_string())
            .ok_or_else(|| StoreError::BadQuery("index spec has no ns".into()))?;
        let keys: Vec<String> = spec
            .find("key")
            .map(|k| k.as_document().keys().map(str::to_string).collect())
            .unwrap_or_default();
        if keys.is_empty() {
            return Err(StoreError::BadQuery("index spec has no key".into()));
        }
        let index = IndexSpec {
            name: spec
                .find("name")
                .map(|e| e.as_str().to_string())
                .unwrap_or_else(|| format!("_{}", keys.concat())),
            keys,
            unique: spec.find("unique").is_some_and(|e| e.as_bool()),
        };

        let mut coll = self.namespaces.entry(ns.clone()).or_default();
        if coll.indexes.iter().any(|i| i.name == index.name) {
            return Ok(false);
        }
        if index.unique {
            for (i, stored) in coll.docs.iter().enumerate() {
                let key = Collection::index_key(stored.doc.view(), &index);
                let clash = coll.docs[i + 1..].iter().any(|other| {
                    Collection::same_key(&key, &Collection::index_key(other.doc.view(), &index))
                });
                if clash {
                    return Err(StoreError::DuplicateKey { index: index.name });
                }
            }
        }
        debug!("index {} on {}", index.name, ns);
        coll.indexes.push(index);
        Ok(true)
    }

    /// Documents matching `query` (which may carry `$query`/`$orderby`),
    /// sorted when asked.
    pub fn find(&self, ns: &str, query: RawDoc<'_>) -> StoreResult<Vec<Bson>> {
        let spec = QuerySpec::parse(query);
        let Some(coll) = self.namespaces.get(ns) else {
            return Ok(Vec::new());
        };
        let mut docs: Vec<Bson> = coll
            .matching(spec.filter)?
            .into_iter()
            .map(|i| coll.docs[i].doc.clone())
            .collect();
        drop(coll);
        if let Some(orderby) = spec.orderby {
            matcher::sort_documents(&mut docs, orderby);
        }
        Ok(docs)
    }

    /// Up to `limit` matching documents inserted after sequence `after`,
    /// with the sequence of the last one returned.
    pub fn find_after(
        &self,
        ns: &str,
        filter: RawDoc<'_>,
        after: u64,
        limit: usize,
    ) -> StoreResult<(Vec<Bson>, u64)> {
        let Some(coll) = self.namespaces.get(ns) else {
            return Ok((Vec::new(), after));
        };
        let mut out = Vec::new();
        let mut last = after;
        for stored in coll.docs.iter().filter(|s| s.seq > after) {
            if out.len() >= limit {
                break;
            }
            if matcher::matches(stored.doc.view(), filter).map_err(StoreError::BadQuery)? {
                out.push(stored.doc.clone());
                last = stored.seq;
            }
        }
        Ok((out, last))
    }

    /// Sequence number of the newest document in `ns`.
    pub fn last_seq(&self, ns: &str) -> u64 {
        self.namespaces
            .get(ns)
            .and_then(|c| c.docs.last().map(|s| s.seq))
            .unwrap_or(0)
    }

    pub fn count(&self, ns: &str, filter: RawDoc<'_>) -> StoreResult<usize> {
        match self.namespaces.get(ns) {
            Some(coll) => Ok(coll.matching(filter)?.len()),
            None => Ok(0),
        }
    }

    pub fn update(
        &self,
        ns: &str,
        selector: RawDoc<'_>,
        update: RawDoc<'_>,
        upsert: bool,
        multi: bool,
    ) -> StoreResult<UpdateOutcome> {
        let is_operator = update.iter().next().is_some_and(|e| e.key().starts_with('$'));
        let mut coll = self.namespaces.entry(ns.to_string()).or_default();
        let mut hits = coll.matching(selector)?;
        if !multi {
            hits.truncate(1);
        }

        if hits.is_empty() {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let (doc, upserted) = if is_operator {
                let base = seed_from_selector(selector)?;
                let applied = apply_operators(base.view(), update)?;
                with_id(applied.view(), selector.find("_id").as_ref())?
            } else {
                with_id(update, selector.find("_id").as_ref())?
            };
            coll.check_unique(doc.view(), None)?;
            let upserted = upserted.or_else(|| {
                doc.find("_id")
                    .filter(|e| e.kind() == BsonType::Oid)
                    .map(|e| e.as_oid())
            });
            let seq = self.seq();
            coll.docs.push(Stored { seq, doc });
            coll.trim_capped();
            return Ok(UpdateOutcome {
                n: 1,
                updated_existing: false,
                upserted,
            });
        }

        for &i in &hits {
            let current = coll.docs[i].doc.view();
            let replacement = if is_operator {
                apply_operators(current, update)?
            } else {
                replace_keeping_id(current, update)?
            };
            coll.check_unique(replacement.view(), Some(i))?;
            coll.docs[i].doc = replacement;
        }
        Ok(UpdateOutcome {
            n: hits.len(),
            updated_existing: true,
            upserted: None,
        })
    }

    pub fn remove(&self, ns: &str, selector: RawDoc<'_>, single: bool) -> StoreResult<usize> {
        let Some(mut coll) = self.namespaces.get_mut(ns) else {
            return Ok(0);
        };
        let mut hits = coll.matching(selector)?;
        if single {
            hits.truncate(1);
        }
        for &i in hits.iter().rev() {
            coll.docs.remove(i);
        }
        Ok(hits.len())
    }

    pub fn create_collection(&self, ns: &str, capped: Option<CappedSpec>) -> StoreResult<()> {
        if self.namespaces.contains_key(ns) {
            return Err(StoreError::NamespaceExists(ns.to_string()));
        }
        self.namespaces.insert(
            ns.to_string(),
            Collection {
                capped,
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Drops a collection and returns how many indexes it had.
    pub fn drop_collection(&self, ns: &str) -> StoreResult<usize> {
        match self.namespaces.remove(ns) {
            Some((_, coll)) => {
                let index_ns = format!("{}.system.indexes", database_of(ns));
                if let Some(mut indexes) = self.namespaces.get_mut(&index_ns) {
                    indexes
                        .docs
                        .retain(|s| s.doc.find("ns").is_none_or(|e| e.as_str() != ns));
                }
                Ok(coll.indexes.len() + 1)
            }
            None => Err(StoreError::NamespaceNotFound(ns.to_string())),
        }
    }

    pub fn drop_database(&self, db: &str) {
        let prefix = format!("{}.", db);
        self.namespaces.retain(|ns, _| !ns.starts_with(&prefix));
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Equality fields of a selector become the base of an upserted document.
fn seed_from_selector(selector: RawDoc<'_>) -> StoreResult<Bson> {
    let mut out = Bson::new();
    for elem in selector.iter() {
        if elem.key().starts_with('$') || elem.key().contains('.') {
            continue;
        }
        let is_operator_doc = elem.kind() == BsonType::Object
            && elem
                .as_document()
                .iter()
                .next()
                .is_some_and(|e| e.key().starts_with('$'));
        if !is_operator_doc {
            out.append_element(None, &elem)?;
        }
    }
    out.finish()?;
    Ok(out)
}

fn replace_keeping_id(current: RawDoc<'_>, update: RawDoc<'_>) -> StoreResult<Bson> {
    let mut out = Bson::new();
    if let Some(id) = current.find("_id") {
        out.append_element(None, &id)?;
    }
    for elem in update.iter().filter(|e| e.key() != "_id") {
        out.append_element(None, &elem)?;
    }
    out.finish()?;
    Ok(out)
}

fn add_numbers(current: Option<&Element<'_>>, delta: &Element<'_>, out: &mut Bson, key: &str) -> StoreResult<()> {
    if !delta.kind().is_numeric() {
        return Err(StoreError::BadUpdate(format!("$inc on {} needs a number", key)));
    }
    let current_kind = match current {
        Some(c) if c.kind().is_numeric() => Some(c.kind()),
        Some(_) => {
            return Err(StoreError::BadUpdate(format!("cannot $inc non-number {}", key)));
        }
        None => None,
    };
    let kinds = [current_kind.unwrap_or(BsonType::Int), delta.kind()];
    if kinds.contains(&BsonType::Double) {
        let base = current.map_or(0.0, |c| c.as_f64());
        out.append_double(key, base + delta.as_f64())?;
    } else {
        let base = current.map_or(0, |c| c.as_i64());
        let sum = base.wrapping_add(delta.as_i64());
        match i32::try_from(sum) {
            Ok(small) if !kinds.contains(&BsonType::Long) => out.append_int(key, small)?,
            _ => out.append_long(key, sum)?,
        }
    }
    Ok(())
}

/// Applies `$set`, `$inc` and `$unset` to top-level fields.
fn apply_operators(current: RawDoc<'_>, update: RawDoc<'_>) -> StoreResult<Bson> {
    let mut set: Vec<Element<'_>> = Vec::new();
    let mut inc: Vec<Element<'_>> = Vec::new();
    let mut unset: Vec<&str> = Vec::new();
    for op in update.iter() {
        let args = op.as_document();
        match op.key() {
            "$set" => set.extend(args.iter()),
            "$inc" => inc.extend(args.iter()),
            "$unset" => unset.extend(args.keys()),
            other => return Err(StoreError::BadUpdate(format!("unsupported modifier {}", other))),
        }
    }
    for key in set.iter().map(|e| e.key()).chain(inc.iter().map(|e| e.key())) {
        if key.contains('.') {
            return Err(StoreError::BadUpdate(format!("nested field {} not supported", key)));
        }
        if key == "_id" {
            return Err(StoreError::BadUpdate("_id cannot be modified".into()));
        }
    }

    let mut out = Bson::new();
    for elem in current.iter() {
        let key = elem.key();
        if unset.contains(&key) {
            continue;
        }
        if let Some(new) = set.iter().find(|e| e.key() == key) {
            out.append_element(None, new)?;
        } else if let Some(delta) = inc.iter().find(|e| e.key() == key) {
            add_numbers(Some(&elem), delta, &mut out, key)?;
        } else {
            out.append_element(None, &elem)?;
        }
    }
    for new in set.iter().filter(|e| current.find(e.key()).is_none() && !unset.contains(&e.key())) {
        out.append_element(None, new)?;
    }
    for delta in inc.iter().filter(|e| current.find(e.key()).is_none()) {
        add_numbers(None, delta, &mut out, delta.key())?;
    }
    out.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwire_core::Token;
    use docwire_core::notation::build;
    use pretty_assertions::assert_eq;

    fn doc(tokens: &[Token<'_>]) -> Bson {
        build(tokens).unwrap()
    }

    #[test]
    fn test_insert_assigns_id_and_finds() {
        let store = Store::new();
        store.insert("db.c", doc(&["a".into(), 1.into()]).view()).unwrap();
        store.insert("db.c", doc(&["a".into(), 2.into()]).view()).unwrap();

        let all = store.find("db.c", Bson::empty().view()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| d.find("_id").is_some_and(|e| e.kind() == BsonType::Oid)));
        assert_eq!(store.count("db.c", doc(&["a".into(), 2.into()]).view()).unwrap(), 1);
        assert!(store.find("db.missing", Bson::empty().view()).unwrap().is_empty());
    }

    #[test]
    fn test_unique_index() {
        let store = Store::new();
        let spec = doc(&[
            "key".into(),
            Token::OpenDoc,
            "k".into(),
            1.into(),
            Token::CloseDoc,
            "ns".into(),
            "db.c".into(),
            "name".into(),
            "_k".into(),
            "unique".into(),
            true.into(),
        ]);
        assert!(store.ensure_index(spec.view()).unwrap());
        assert!(!store.ensure_index(spec.view()).unwrap());
        store.insert("db.c", doc(&["k".into(), 1.into()]).view()).unwrap();
        let err = store.insert("db.c", doc(&["k".into(), 1.0.into()]).view()).unwrap_err();
        assert_eq!(err.code(), DUPLICATE_KEY_CODE);
        store.insert("db.c", doc(&["k".into(), 2.into()]).view()).unwrap();
    }

    #[test]
    fn test_update_operators_and_upsert() {
        let store = Store::new();
        store
            .insert("db.c", doc(&["name".into(), "a".into(), "n".into(), 1.into()]).view())
            .unwrap();

        let sel = doc(&["name".into(), "a".into()]);
        let upd = doc(&[
            "$inc".into(),
            Token::OpenDoc,
            "n".into(),
            2.into(),
            Token::CloseDoc,
            "$set".into(),
            Token::OpenDoc,
            "x".into(),
            "y".into(),
            Token::CloseDoc,
        ]);
        let out = store.update("db.c", sel.view(), upd.view(), false, false).unwrap();
        assert!(out.updated_existing);
        let found = store.find("db.c", sel.view()).unwrap();
        assert_eq!(found[0].find("n").unwrap().as_i32(), 3);
        assert_eq!(found[0].find("x").unwrap().as_str(), "y");

        let sel = doc(&["name".into(), "b".into()]);
        let out = store.update("db.c", sel.view(), upd.view(), true, false).unwrap();
        assert!(!out.updated_existing);
        assert!(out.upserted.is_some());
        let found = store.find("db.c", sel.view()).unwrap();
        assert_eq!(found[0].find("n").unwrap().as_i32(), 2);
    }

    #[test]
    fn test_replacement_keeps_id_and_remove_single() {
        let store = Store::new();
        for i in 0..3i32 {
            store.insert("db.c", doc(&["g".into(), 1.into(), "i".into(), i.into()]).view()).unwrap();
        }
        let first = store.find("db.c", doc(&["i".into(), 0.into()]).view()).unwrap();
        let id = first[0].find("_id").unwrap().as_oid();

        store
            .update("db.c", doc(&["i".into(), 0.into()]).view(), doc(&["i".into(), 10.into()]).view(), false, false)
            .unwrap();
        let replaced = store.find("db.c", doc(&["i".into(), 10.into()]).view()).unwrap();
        assert_eq!(replaced[0].find("_id").unwrap().as_oid(), id);
        assert!(replaced[0].find("g").is_none());

        assert_eq!(store.remove("db.c", doc(&["g".into(), 1.into()]).view(), true).unwrap(), 1);
        assert_eq!(store.count("db.c", Bson::empty().view()).unwrap(), 2);
    }

    #[test]
    fn test_capped_and_tail() {
        let store = Store::new();
        store
            .create_collection("db.cap", Some(CappedSpec { size: 0, max: 3 }))
            .unwrap();
        assert!(store.create_collection("db.cap", None).is_err());
        for i in 0..5i32 {
            store.insert("db.cap", doc(&["i".into(), i.into()]).view()).unwrap();
        }
        let all = store.find("db.cap", Bson::empty().view()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].find("i").unwrap().as_i32(), 2);

        let (first, last) = store.find_after("db.cap", Bson::empty().view(), 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let (rest, end) = store.find_after("db.cap", Bson::empty().view(), last, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(end, store.last_seq("db.cap"));
    }
}
