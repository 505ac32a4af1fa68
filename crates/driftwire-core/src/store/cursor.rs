//! Query snapshots.
//!
//! A [`Cursor`] is an immutable snapshot of the documents that matched
//! a selector at `find` time, plus the originating selector so
//! [`Cursor::observe`] can keep filtering live changes.

use std::collections::BTreeMap;

use serde_json::Value;

use super::matcher::compare;
use super::observer::{ObserveCallbacks, ObserverHandle};
use super::{CollectionStore, Document};

/// Sort direction for one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// Options accepted by `find`.
#[derive(Default, Clone)]
pub struct FindOptions {
    /// Sort keys, applied in order.
    pub sort: Vec<(String, SortOrder)>,
    /// Maximum number of documents, applied after `skip`.
    pub limit: Option<usize>,
    /// Documents to skip from the front of the (sorted) result.
    pub skip: usize,
    /// Field projection: all-`true` values select an inclusion set
    /// (`_id` kept unless explicitly mapped to `false`), otherwise the
    /// `false`-mapped fields are excluded.
    pub fields: Option<BTreeMap<String, bool>>,
}

impl FindOptions {
    pub(crate) fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if !self.sort.is_empty() {
            docs.sort_by(|a, b| {
                for (field, order) in &self.sort {
                    let ord = match (a.get(field), b.get(field)) {
                        (Some(x), Some(y)) => {
                            compare(x, y).unwrap_or(std::cmp::Ordering::Equal)
                        },
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (None, None) => std::cmp::Ordering::Equal,
                    };
                    let ord = match order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let mut docs: Vec<Document> = docs.into_iter().skip(self.skip).collect();
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }

        if let Some(spec) = &self.fields {
            docs = docs.into_iter().map(|doc| project(doc, spec)).collect();
        }
        docs
    }
}

fn project(doc: Document, spec: &BTreeMap<String, bool>) -> Document {
    let inclusion = spec.values().any(|keep| *keep);
    if inclusion {
        let drop_id = spec.get("_id") == Some(&false);
        doc.into_iter()
            .filter(|(key, _)| {
                if key == "_id" {
                    !drop_id
                } else {
                    spec.get(key) == Some(&true)
                }
            })
            .collect()
    } else {
        doc.into_iter().filter(|(key, _)| spec.get(key) != Some(&false)).collect()
    }
}

/// Immutable snapshot of matched documents plus the selector that
/// produced it.
pub struct Cursor {
    pub(crate) store: CollectionStore,
    pub(crate) collection: String,
    pub(crate) selector: Option<Value>,
    pub(crate) docs: Vec<Document>,
}

impl Cursor {
    /// Materialize the snapshot.
    #[must_use]
    pub fn fetch(&self) -> Vec<Document> {
        self.docs.clone()
    }

    /// Number of matched documents.
    #[must_use]
    pub fn count(&self) -> usize {
        self.docs.len()
    }

    /// Visit each matched document.
    pub fn for_each(&self, mut f: impl FnMut(&Document)) {
        for doc in &self.docs {
            f(doc);
        }
    }

    /// Map each matched document.
    pub fn map<R>(&self, f: impl FnMut(&Document) -> R) -> Vec<R> {
        self.docs.iter().map(f).collect()
    }

    /// Register a selector-filtered observer for live changes.
    ///
    /// `added` and `changed` fire only when the post-image matches this
    /// cursor's selector (or the selector is `None`); `removed` always
    /// fires, since a deleted document can no longer be re-checked.
    #[must_use]
    pub fn observe(&self, callbacks: ObserveCallbacks) -> ObserverHandle {
        self.store.register_cursor_observer(&self.collection, self.selector.clone(), callbacks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(v: Value) -> Document {
        v.as_object().unwrap().clone()
    }

    fn sample() -> Vec<Document> {
        vec![
            doc(json!({"_id": "a", "n": 3, "tag": "x"})),
            doc(json!({"_id": "b", "n": 1, "tag": "y"})),
            doc(json!({"_id": "c", "n": 2, "tag": "x"})),
        ]
    }

    #[test]
    fn sort_skip_limit() {
        let options = FindOptions {
            sort: vec![("n".to_string(), SortOrder::Asc)],
            skip: 1,
            limit: Some(1),
            fields: None,
        };
        let out = options.apply(sample());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["_id"], "c");
    }

    #[test]
    fn sort_desc() {
        let options =
            FindOptions { sort: vec![("n".to_string(), SortOrder::Desc)], ..Default::default() };
        let out = options.apply(sample());
        assert_eq!(out[0]["_id"], "a");
        assert_eq!(out[2]["_id"], "b");
    }

    #[test]
    fn inclusion_projection_keeps_id() {
        let spec = BTreeMap::from([("n".to_string(), true)]);
        let options = FindOptions { fields: Some(spec), ..Default::default() };
        let out = options.apply(sample());
        assert_eq!(out[0].keys().collect::<Vec<_>>(), vec!["_id", "n"]);
    }

    #[test]
    fn exclusion_projection_drops_listed() {
        let spec = BTreeMap::from([("tag".to_string(), false)]);
        let options = FindOptions { fields: Some(spec), ..Default::default() };
        let out = options.apply(sample());
        assert!(out[0].get("tag").is_none());
        assert!(out[0].get("_id").is_some());
    }

    #[test]
    fn inclusion_can_drop_id_explicitly() {
        let spec = BTreeMap::from([("n".to_string(), true), ("_id".to_string(), false)]);
        let options = FindOptions { fields: Some(spec), ..Default::default() };
        let out = options.apply(sample());
        assert_eq!(out[0].keys().collect::<Vec<_>>(), vec!["n"]);
    }
}
