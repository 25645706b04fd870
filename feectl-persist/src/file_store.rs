use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use feectl::persist::{
    apply_set, document_id, order_results, upsert_document, Document, Error, Filter, Sort, Store,
    UpdateOutcome,
};
use feectl::SendSync;
use tempfile::NamedTempFile;
use tracing::*;

const EXTENSION: &str = "json";

/// A [`Store`] on the local filesystem.
///
/// Each collection is a directory under the root, and a collection name with
/// slashes is a nested directory, so `backups/hot` lives in `<root>/backups/hot`.
/// Each document is a JSON file named after the hex encoding of its key.
/// Writes go to a temporary file that is then renamed over the target, so a
/// crash never leaves a torn document behind.
pub struct FileStore {
    root: PathBuf,
    // serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl SendSync for FileStore {}

fn io_error(path: &Path, e: io::Error) -> Error {
    Error::Unavailable(format!("{}: {}", path.display(), e))
}

impl FileStore {
    /// Open a store, creating the root directory if needed
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        if !root.is_dir() {
            return Err(Error::Unavailable(format!("{} is not a directory", root.display())));
        }
        info!("file store at {}", root.display());
        Ok(FileStore { root, lock: Mutex::new(()) })
    }

    /// The root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding a collection
    pub fn collection_dir(&self, collection: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(collection);
        let valid = !collection.is_empty()
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::Internal(format!("invalid collection name {:?}", collection)));
        }
        Ok(self.root.join(relative))
    }

    fn guard(&self) -> Result<MutexGuard<()>, Error> {
        self.lock.lock().map_err(|_| Error::Internal("lock poisoned".to_string()))
    }

    fn document_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{}.{}", hex::encode(id), EXTENSION))
    }

    fn read_document(path: &Path) -> Result<Document, Error> {
        let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Internal(format!("{}: {}", path.display(), e)))
    }

    fn read_if_exists(path: &Path) -> Result<Option<Document>, Error> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Internal(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }

    fn write_document(dir: &Path, doc: &Document) -> Result<(), Error> {
        let path = Self::document_path(dir, document_id(doc)?);
        let bytes = serde_json::to_vec(doc).map_err(|e| Error::Internal(e.to_string()))?;
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
        tmp.write_all(&bytes).map_err(|e| io_error(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| io_error(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| io_error(&path, e.error))?;
        trace!("wrote {}", path.display());
        Ok(())
    }

    // the documents of a collection in key order, or only the keyed one
    fn load(&self, dir: &Path, filter: &Filter) -> Result<Vec<(PathBuf, Document)>, Error> {
        if let Some(id) = filter.id() {
            let path = Self::document_path(dir, id);
            return Ok(Self::read_if_exists(&path)?
                .filter(|doc| filter.matches(doc))
                .map(|doc| vec![(path, doc)])
                .unwrap_or_default());
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(dir, e)),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_error(dir, e))?.path();
            // skips nested collections and temporary files
            if path.is_file() && path.extension().map_or(false, |ext| ext == EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        let mut out = Vec::new();
        for path in paths {
            let doc = Self::read_document(&path)?;
            if filter.matches(&doc) {
                out.push((path, doc));
            }
        }
        Ok(out)
    }
}

impl Store for FileStore {
    fn insert_one(&self, collection: &str, doc: Document) -> Result<(), Error> {
        let dir = self.collection_dir(collection)?;
        let _guard = self.guard()?;
        let id = document_id(&doc)?;
        if Self::document_path(&dir, id).exists() {
            debug!("insert conflict in {}: {}", collection, id);
            return Err(Error::AlreadyExists(format!("{}/{}", collection, id)));
        }
        Self::write_document(&dir, &doc)
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome, Error> {
        let dir = self.collection_dir(collection)?;
        let _guard = self.guard()?;
        if let Some((_, mut doc)) = self.load(&dir, filter)?.into_iter().next() {
            apply_set(&mut doc, set)?;
            Self::write_document(&dir, &doc)?;
            return Ok(UpdateOutcome::Updated);
        }
        if !upsert {
            return Ok(UpdateOutcome::NotMatched);
        }
        let doc = upsert_document(filter, set)?;
        let id = document_id(&doc)?;
        if Self::document_path(&dir, id).exists() {
            // the key exists but the other conditions did not match
            return Err(Error::AlreadyExists(format!("{}/{}", collection, id)));
        }
        Self::write_document(&dir, &doc)?;
        Ok(UpdateOutcome::Inserted)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, Error> {
        let dir = self.collection_dir(collection)?;
        let _guard = self.guard()?;
        Ok(self.load(&dir, filter)?.into_iter().next().map(|(_, doc)| doc))
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Error> {
        let dir = self.collection_dir(collection)?;
        let _guard = self.guard()?;
        let docs = self.load(&dir, filter)?.into_iter().map(|(_, doc)| doc).collect();
        Ok(order_results(docs, sort, limit))
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<usize, Error> {
        let dir = self.collection_dir(collection)?;
        let _guard = self.guard()?;
        let mut deleted = 0;
        for (path, _) in self.load(&dir, filter)? {
            fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
