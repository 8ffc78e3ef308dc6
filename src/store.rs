//! Places objects can be stored - the real server, or an in-memory fake
//! that tests use to count exactly what the engine sends.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::hashing::ObjectId;

/// `c` or `p` in the device history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Complete,
    Partial,
}

impl SnapshotKind {
    pub fn as_char(self) -> char {
        match self {
            SnapshotKind::Complete => 'c',
            SnapshotKind::Partial => 'p',
        }
    }
}

/// One entry in the per-device backup history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub tstamp: DateTime<Utc>,
    pub root: ObjectId,
    pub kind: SnapshotKind,
}

/// The object namespace and history endpoint the engine consumes.
///
/// All methods block. Two clients racing on the same hash both observe
/// `test_object` false and both upload; the store is content-addressed, so
/// the second write is idempotent and exactly one copy is kept.
pub trait ObjectStore: Send + Sync {
    /// Is the object already present? (HEAD)
    fn test_object(&self, id: &ObjectId) -> Result<bool>;

    /// Store an object under the hash of its bytes. (POST)
    fn upload_object(&self, bytes: &[u8]) -> Result<()>;

    /// Retrieve an object's bytes. (GET)
    fn fetch_object(&self, id: &ObjectId) -> Result<Vec<u8>>;

    /// Publish a backup root to the device history.
    fn commit_history(&self, entry: &HistoryEntry) -> Result<()>;
}

/// In-memory store. Counts requests so tests can assert the engine's
/// deduplication properties (how many HEADs and POSTs a run issued).
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<FxHashMap<ObjectId, Vec<u8>>>,
    pub history: Mutex<Vec<HistoryEntry>>,
    pub heads: AtomicU64,
    pub posts: AtomicU64,
    pub gets: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.lock().unwrap().contains_key(id)
    }

    pub fn object(&self, id: &ObjectId) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn head_count(&self) -> u64 {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn post_count(&self) -> u64 {
        self.posts.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryStore {
    fn test_object(&self, id: &ObjectId) -> Result<bool> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        Ok(self.contains(id))
    }

    fn upload_object(&self, bytes: &[u8]) -> Result<()> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        let id = ObjectId::hash(bytes);
        // Second write of the same name is idempotent.
        self.objects.lock().unwrap().insert(id, bytes.to_vec());
        Ok(())
    }

    fn fetch_object(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.object(id).ok_or(Error::NotFound)
    }

    fn commit_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.history.lock().unwrap().push(entry.clone());
        Ok(())
    }
}
