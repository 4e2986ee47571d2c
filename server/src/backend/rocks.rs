use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rocksdb::{IteratorMode, DB};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Backend, BackendError, Entry};

/// What actually lands in RocksDB: the caller's bytes plus the instant after
/// which they no longer count.
#[derive(Serialize, Deserialize)]
struct Envelope {
    deadline: Option<DateTime<Utc>>,
    value: Vec<u8>,
}

impl Envelope {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(true, |deadline| now < deadline)
    }
}

/// Embedded on-disk backend.
///
/// RocksDB is opened by a single process, so one write lock is enough to make
/// every compare-and-swap atomic. Plain reads skip the lock.
pub struct RocksBackend {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        Ok(Self {
            db: DB::open_default(path)?,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, BackendError> {
        self.write_lock.lock().map_err(|_| BackendError::Poisoned)
    }

    fn live_envelope(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Envelope>, BackendError> {
        let envelope = match self.db.get(key)? {
            Some(bytes) => bincode::deserialize::<Envelope>(&bytes)?,
            None => return Ok(None),
        };
        Ok(Some(envelope).filter(|envelope| envelope.is_live(now)))
    }

    /// Scans a snapshot for entries whose deadline passed. Takes no lock, so
    /// writers keep going while a large database is walked.
    fn lapsed_entries(&self, now: DateTime<Utc>) -> Vec<(Box<[u8]>, Box<[u8]>)> {
        let snapshot = self.db.snapshot();
        snapshot
            .iterator(IteratorMode::Start)
            .filter(|(_, value)| {
                // Undecodable entries are left for an operator to look at.
                bincode::deserialize::<Envelope>(value)
                    .as_ref()
                    .map(|envelope| !envelope.is_live(now))
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Deletes each scanned entry only if it still holds the bytes the scan
    /// saw, so a fresh write under a lapsed key survives.
    fn remove_unchanged(&self, lapsed: &[(Box<[u8]>, Box<[u8]>)]) -> Result<usize, BackendError> {
        let mut removed = 0;
        for (key, value) in lapsed {
            let _guard = self.lock()?;
            if self.db.get(key)?.as_deref() == Some(&**value) {
                self.db.delete(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl Backend for RocksBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self
            .live_envelope(key, Utc::now())?
            .map(|envelope| envelope.value))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Entry>,
    ) -> Result<bool, BackendError> {
        let _guard = self.lock()?;
        let now = Utc::now();

        let current = self.live_envelope(key, now)?;
        if current.as_ref().map(|envelope| envelope.value.as_slice()) != expected {
            return Ok(false);
        }

        match new {
            Some(Entry { value, ttl }) => {
                let deadline = ttl
                    .and_then(|ttl| Duration::from_std(ttl).ok())
                    .and_then(|ttl| now.checked_add_signed(ttl));
                let bytes = bincode::serialize(&Envelope { deadline, value })?;
                self.db.put(key, bytes)?;
            }
            None => self.db.delete(key)?,
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        let _guard = self.lock()?;
        self.db.delete(key)?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, BackendError> {
        let lapsed = self.lapsed_entries(Utc::now());
        let removed = self.remove_unchanged(&lapsed)?;
        if removed > 0 {
            debug!(removed, "purged lapsed entries");
        }
        Ok(removed)
    }

    fn ping(&self) -> Result<(), BackendError> {
        self.db.get(b"\0ping")?;
        Ok(())
    }
}
