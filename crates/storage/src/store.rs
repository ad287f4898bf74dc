//! The transactional key-value store contract (§4.1).
//!
//! Grounded on `ethrex_storage::store::Store`: a `Clone`-able, thread-safe
//! handle around an `Arc`-wrapped backend. Crank/savepoint bookkeeping is an
//! in-memory overlay stack of write-sets layered in front of the backend —
//! a write-ahead journal with named checkpoints, one of the two
//! implementation strategies the spec explicitly allows.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::StorageBackend;
use crate::error::StoreError;

/// One write-set accumulated since a named savepoint was created. A
/// tombstone (`None`) records a pending delete so reads inside the crank
/// see it as absent without touching the backend yet.
#[derive(Debug, Default)]
struct Frame {
    name: String,
    writes: std::collections::HashMap<Vec<u8>, Option<Vec<u8>>>,
}

#[derive(Debug)]
struct CrankState {
    frames: Vec<Frame>,
}

impl CrankState {
    fn lookup(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        for frame in self.frames.iter().rev() {
            if let Some(entry) = frame.writes.get(key) {
                return Some(entry.clone());
            }
        }
        None
    }
}

/// The kernel's transactional key-value store.
///
/// `Store` is `Clone` and thread-safe: clones share the same backend and
/// crank state via `Arc`, mirroring `ethrex_storage::Store`.
#[derive(Debug, Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
    crank: Arc<Mutex<Option<CrankState>>>,
    quiescent: Arc<tokio::sync::Notify>,
}

impl Store {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Store {
            backend,
            crank: Arc::new(Mutex::new(None)),
            quiescent: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Reads see the crank's pending writes first, falling back to the
    /// committed backend. Valid whether or not a crank is active.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(crank) = self.crank.lock().as_ref() {
            if let Some(value) = crank.lookup(key) {
                return Ok(value);
            }
        }
        self.backend.get(key)
    }

    /// Outside a crank, writes apply immediately; inside one, they land in
    /// the innermost open savepoint frame.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.crank.lock();
        match guard.as_mut() {
            Some(crank) => {
                let frame = crank
                    .frames
                    .last_mut()
                    .ok_or(StoreError::NotInCrank)?;
                frame.writes.insert(key.to_vec(), Some(value.to_vec()));
                Ok(())
            }
            None => self.backend.set(key, value),
        }
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.crank.lock();
        match guard.as_mut() {
            Some(crank) => {
                let frame = crank
                    .frames
                    .last_mut()
                    .ok_or(StoreError::NotInCrank)?;
                frame.writes.insert(key.to_vec(), None);
                Ok(())
            }
            None => self.backend.delete(key),
        }
    }

    /// Enumeration merges pending crank writes over the backend's committed
    /// state; tombstones suppress entries that haven't been persisted yet.
    pub fn enumerate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = self
            .backend
            .enumerate(prefix)?
            .into_iter()
            .collect();

        if let Some(crank) = self.crank.lock().as_ref() {
            for frame in &crank.frames {
                for (key, value) in &frame.writes {
                    if !key.starts_with(prefix) {
                        continue;
                    }
                    match value {
                        Some(v) => {
                            merged.insert(key.clone(), v.clone());
                        }
                        None => {
                            merged.remove(key);
                        }
                    }
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    /// Begins a crank: the scope of atomicity for a single delivery (§4.1,
    /// §4.7). Pushes an initial anonymous frame so writes before the
    /// caller's first explicit savepoint have somewhere to land.
    pub fn start_crank(&self) -> Result<(), StoreError> {
        let mut guard = self.crank.lock();
        if guard.is_some() {
            return Err(StoreError::CrankAlreadyActive);
        }
        *guard = Some(CrankState {
            frames: vec![Frame::default()],
        });
        trace!("crank started");
        Ok(())
    }

    /// Commits the crank: every frame's writes are flattened in
    /// chronological order and applied to the backend atomically from the
    /// caller's point of view (no other `Store` method observes a partial
    /// application, since the crank mutex is held throughout).
    pub fn end_crank(&self) -> Result<(), StoreError> {
        let mut guard = self.crank.lock();
        let crank = guard.take().ok_or(StoreError::NotInCrank)?;
        for frame in crank.frames {
            for (key, value) in frame.writes {
                match value {
                    Some(v) => self.backend.set(&key, &v)?,
                    None => self.backend.delete(&key)?,
                }
            }
        }
        drop(guard);
        self.quiescent.notify_waiters();
        debug!("crank committed");
        Ok(())
    }

    /// Creates a nestable named savepoint within the current crank.
    pub fn create_savepoint(&self, name: &str) -> Result<(), StoreError> {
        let mut guard = self.crank.lock();
        let crank = guard.as_mut().ok_or(StoreError::NotInCrank)?;
        crank.frames.push(Frame {
            name: name.to_owned(),
            writes: Default::default(),
        });
        Ok(())
    }

    /// Discards every write recorded since `name` was created, including
    /// writes in nested savepoints opened after it. The named frame itself
    /// survives (emptied) so it can be rolled back to again.
    pub fn rollback_to(&self, name: &str) -> Result<(), StoreError> {
        let mut guard = self.crank.lock();
        let crank = guard.as_mut().ok_or(StoreError::NotInCrank)?;
        let idx = crank
            .frames
            .iter()
            .rposition(|f| f.name == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_owned()))?;
        crank.frames.truncate(idx + 1);
        crank.frames[idx].writes.clear();
        trace!(savepoint = name, "rolled back");
        Ok(())
    }

    pub fn is_in_crank(&self) -> bool {
        self.crank.lock().is_some()
    }

    /// Resolves once no crank is active. Used by `terminateVat`/restart
    /// logic to observe quiescence before mutating endpoint state outside
    /// the normal crank bracket.
    pub async fn wait_for_crank(&self) {
        loop {
            if !self.is_in_crank() {
                return;
            }
            self.quiescent.notified().await;
        }
    }
}
