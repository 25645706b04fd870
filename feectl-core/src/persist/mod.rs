use core::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::prelude::*;

/// An in-memory store
pub mod memory;

/// A stored document
pub type Document = serde_json::Map<String, Value>;

/// The primary key field of every document
pub const ID_FIELD: &str = "_id";

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
/// Error returned by a store
pub enum Error {
    /// Store is temporarily unavailable, might work later
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Inconsistent state, needed resource is missing
    #[error("not found: {0}")]
    NotFound(String),
    /// Inconsistent state, resource already present
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Non-recoverable internal error
    #[error("internal store error: {0}")]
    Internal(String),
}

impl Error {
    /// A stable, machine checkable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Unavailable(_) => "store_unavailable",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Internal(_) => "store_internal",
        }
    }
}

/// A conjunction of field equality conditions
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// A filter matching every document
    pub fn all() -> Self {
        Filter::default()
    }

    /// A filter matching the document with the given primary key
    pub fn by_id(id: impl Into<String>) -> Self {
        Filter::all().eq(ID_FIELD, id.into())
    }

    /// Add an equality condition
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    /// The primary key this filter pins, if any
    pub fn id(&self) -> Option<&str> {
        self.conditions.iter().find(|(f, _)| f == ID_FIELD).and_then(|(_, v)| v.as_str())
    }

    /// Whether the document satisfies every condition
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, value)| doc.get(field) == Some(value))
    }

    /// The conditions, as fields of a new document (used by upserts)
    pub fn as_document(&self) -> Document {
        self.conditions.iter().cloned().collect()
    }
}

/// Sort direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    #[allow(missing_docs)]
    Ascending,
    #[allow(missing_docs)]
    Descending,
}

/// Ordering of query results by one field
#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    /// the field
    pub field: String,
    /// the direction
    pub order: SortOrder,
}

impl Sort {
    /// Ascending by field
    pub fn asc(field: impl Into<String>) -> Self {
        Sort { field: field.into(), order: SortOrder::Ascending }
    }

    /// Descending by field
    pub fn desc(field: impl Into<String>) -> Self {
        Sort { field: field.into(), order: SortOrder::Descending }
    }

    /// Compare two documents by the sort field.  Missing fields sort first.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let ord = compare_values(a.get(&self.field), b.get(&self.field));
        match self.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// The result of [`Store::update_one`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// an existing document was updated
    Updated,
    /// no document matched, and a new one was created
    Inserted,
    /// no document matched
    NotMatched,
}

/// A document store, organized in named collections.
///
/// Each document carries a string primary key in [`ID_FIELD`].  Every operation
/// is atomic with respect to a single document, which gives callers
/// create-if-absent ([`Store::insert_one`]) and compare-and-set
/// ([`Store::update_one`] with the expected values in the filter).
pub trait Store: SendSync {
    /// Insert a document, failing with [`Error::AlreadyExists`] if the key is taken
    fn insert_one(&self, collection: &str, doc: Document) -> Result<(), Error>;

    /// Set fields on the first document matching the filter.
    ///
    /// If nothing matches and `upsert` is set, a document built from the
    /// filter conditions and `set` is inserted.  The filter or `set` must then
    /// supply the primary key.
    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error>;

    /// Get the first document matching the filter
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, Error>;

    /// Get the documents matching the filter
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Error>;

    /// Delete the documents matching the filter, returning how many were deleted
    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<usize, Error>;
}

/// Get the primary key of a document
pub fn document_id(doc: &Document) -> Result<&str, Error> {
    doc.get(ID_FIELD)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Internal(format!("document without string {}", ID_FIELD)))
}

/// Merge `set` into `doc`.  The primary key cannot change.
pub fn apply_set(doc: &mut Document, set: Document) -> Result<(), Error> {
    if let (Some(new_id), Some(old_id)) = (set.get(ID_FIELD), doc.get(ID_FIELD)) {
        if new_id != old_id {
            return Err(Error::Internal("primary key cannot be updated".to_string()));
        }
    }
    for (k, v) in set {
        doc.insert(k, v);
    }
    Ok(())
}

/// Build the document an upsert inserts
pub fn upsert_document(filter: &Filter, set: Document) -> Result<Document, Error> {
    let mut doc = filter.as_document();
    apply_set(&mut doc, set)?;
    document_id(&doc)?;
    Ok(doc)
}

/// Sort and truncate query results
pub fn order_results(
    mut docs: Vec<Document>,
    sort: Option<&Sort>,
    limit: Option<usize>,
) -> Vec<Document> {
    if let Some(sort) = sort {
        docs.sort_by(|a, b| sort.compare(a, b));
    }
    if let Some(limit) = limit {
        docs.truncate(limit);
    }
    docs
}

/// Serialize a record into a document
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, Error> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::Internal(format!("expected an object, got {}", other))),
        Err(e) => Err(Error::Internal(e.to_string())),
    }
}

/// Deserialize a document into a record
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, Error> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| Error::Internal(e.to_string()))
}

/// Map a poisoned lock to a store error
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Internal("lock poisoned".to_string())
}
