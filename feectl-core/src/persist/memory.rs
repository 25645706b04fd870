use crate::persist::{
    apply_set, document_id, order_results, poisoned, upsert_document, Document, Error, Filter,
    Sort, Store, UpdateOutcome,
};
use crate::prelude::*;
use tracing::*;

type Collection = OrderedMap<String, Document>;

/// A document store held in memory.
///
/// Used in tests and when durability is not required.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<OrderedMap<String, Collection>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SendSync for MemoryStore {}

impl Store for MemoryStore {
    fn insert_one(&self, collection: &str, doc: Document) -> Result<(), Error> {
        let id = document_id(&doc)?.to_string();
        let mut data = self.data.lock().map_err(poisoned)?;
        let coll = data.entry(collection.to_string()).or_default();
        if coll.contains_key(&id) {
            debug!("insert conflict in {}: {}", collection, id);
            return Err(Error::AlreadyExists(format!("{}/{}", collection, id)));
        }
        coll.insert(id, doc);
        Ok(())
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        let mut data = self.data.lock().map_err(poisoned)?;
        let coll = data.entry(collection.to_string()).or_default();
        if let Some(doc) = coll.values_mut().find(|d| filter.matches(d)) {
            apply_set(doc, set)?;
            return Ok(UpdateOutcome::Updated);
        }
        if !upsert {
            return Ok(UpdateOutcome::NotMatched);
        }
        let doc = upsert_document(filter, set)?;
        let id = document_id(&doc)?.to_string();
        if coll.contains_key(&id) {
            // the key exists but the other conditions did not match
            return Err(Error::AlreadyExists(format!("{}/{}", collection, id)));
        }
        coll.insert(id, doc);
        Ok(UpdateOutcome::Inserted)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, Error> {
        let data = self.data.lock().map_err(poisoned)?;
        let found = data.get(collection).and_then(|coll| match filter.id() {
            Some(id) => coll.get(id).filter(|d| filter.matches(d)).cloned(),
            None => coll.values().find(|d| filter.matches(d)).cloned(),
        });
        Ok(found)
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Error> {
        let data = self.data.lock().map_err(poisoned)?;
        let docs = match data.get(collection) {
            Some(coll) => coll.values().filter(|d| filter.matches(d)).cloned().collect(),
            None => Vec::new(),
        };
        Ok(order_results(docs, sort, limit))
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<usize, Error> {
        let mut data = self.data.lock().map_err(poisoned)?;
        let coll = match data.get_mut(collection) {
            Some(coll) => coll,
            None => return Ok(0),
        };
        let before = coll.len();
        coll.retain(|_, d| !filter.matches(d));
        Ok(before - coll.len())
    }
}
