use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use super::{Backend, BackendError, Entry};

struct Slot {
    value: Vec<u8>,
    deadline: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.map_or(true, |deadline| now < deadline)
    }
}

/// In-process backend. Everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>, BackendError> {
        self.slots.lock().map_err(|_| BackendError::Poisoned)
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut slots = self.slots()?;
        match slots.get(key) {
            Some(slot) if slot.is_live(Instant::now()) => Ok(Some(slot.value.clone())),
            Some(_) => {
                slots.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Entry>,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut slots = self.slots()?;

        let current = slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.as_slice());
        if current != expected {
            return Ok(false);
        }

        match new {
            Some(Entry { value, ttl }) => {
                let deadline = ttl.map(|ttl| now + ttl);
                slots.insert(key.to_owned(), Slot { value, deadline });
            }
            None => {
                slots.remove(key);
            }
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.slots()?.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, BackendError> {
        let now = Instant::now();
        let mut slots = self.slots()?;
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        Ok(before - slots.len())
    }

    fn ping(&self) -> Result<(), BackendError> {
        self.slots().map(drop)
    }
}
