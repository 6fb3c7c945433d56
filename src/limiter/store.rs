//! Attempt record stores.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Local;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AttemptRecord;
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Backing store for attempt records.
///
/// `update` must apply `f` atomically with respect to other calls for the
/// same identity. Returning `None` from `f` removes the record.
pub trait AttemptStore: Send + Sync {
    fn get(&self, identity: &str) -> Result<Option<AttemptRecord>>;

    fn update(
        &self,
        identity: &str,
        f: &mut dyn FnMut(Option<AttemptRecord>) -> Option<AttemptRecord>,
    ) -> Result<Option<AttemptRecord>>;

    /// Keep only records for which `keep` returns true; returns how many were dropped.
    fn retain(&self, keep: &mut dyn FnMut(&AttemptRecord) -> bool) -> Result<usize>;

    /// Number of identities with a record.
    fn count(&self) -> Result<usize>;
}

/// Sharded in-memory store. Updates lock only the shard holding the identity.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    records: DashMap<String, AttemptRecord>,
}

impl MemoryAttemptStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn get(&self, identity: &str) -> Result<Option<AttemptRecord>> {
        Ok(self.records.get(identity).map(|r| r.value().clone()))
    }

    fn update(
        &self,
        identity: &str,
        f: &mut dyn FnMut(Option<AttemptRecord>) -> Option<AttemptRecord>,
    ) -> Result<Option<AttemptRecord>> {
        let updated = match self.records.entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => match f(Some(occupied.get().clone())) {
                Some(record) => {
                    occupied.insert(record.clone());
                    Some(record)
                }
                None => {
                    occupied.remove();
                    None
                }
            },
            Entry::Vacant(vacant) => match f(None) {
                Some(record) => {
                    vacant.insert(record.clone());
                    Some(record)
                }
                None => None,
            },
        };
        Ok(updated)
    }

    fn retain(&self, keep: &mut dyn FnMut(&AttemptRecord) -> bool) -> Result<usize> {
        let mut dropped = 0;
        self.records.retain(|_, record| {
            let kept = keep(record);
            if !kept {
                dropped += 1;
            }
            kept
        });
        Ok(dropped)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}

/// Serialized form of the file-backed store.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct AttemptLedger {
    records: HashMap<String, AttemptRecord>,
    creation_date: String,
}

impl AttemptLedger {
    pub fn new() -> Self {
        AttemptLedger {
            records: HashMap::new(),
            creation_date: Local::now().to_string(),
        }
    }

    pub fn get(&self, identity: &str) -> Option<&AttemptRecord> {
        self.records.get(identity)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &AttemptRecord)> {
        self.records.iter()
    }

    pub fn creation_date(&self) -> &str {
        &self.creation_date
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Ledger persisted as JSON so lockouts survive process restarts.
///
/// All updates go through one mutex and rewrite the file atomically. Two
/// processes sharing a ledger file may overwrite each other's updates.
pub struct FileAttemptStore {
    storage: Storage,
    ledger: Mutex<AttemptLedger>,
}

impl FileAttemptStore {
    /// Opens the ledger at `storage`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing ledger cannot be read or parsed.
    pub fn open(storage: Storage) -> Result<Self> {
        let ledger = match storage.load_if_present()? {
            Some(data) => serde_json::from_slice(&data).map_err(|e| {
                Error::Config(format!(
                    "attempt ledger {} is unreadable: {e}",
                    storage.path().display()
                ))
            })?,
            None => AttemptLedger::new(),
        };
        debug!(path = %storage.path().display(), records = ledger.len(), "attempt ledger opened");
        Ok(Self {
            storage,
            ledger: Mutex::new(ledger),
        })
    }

    pub fn snapshot(&self) -> AttemptLedger {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AttemptLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, ledger: &AttemptLedger) -> Result<()> {
        let data = serde_json::to_vec_pretty(ledger)
            .map_err(|e| Error::Config(format!("cannot encode attempt ledger: {e}")))?;
        self.storage.save(&data)
    }
}

impl AttemptStore for FileAttemptStore {
    fn get(&self, identity: &str) -> Result<Option<AttemptRecord>> {
        Ok(self.lock().get(identity).cloned())
    }

    fn update(
        &self,
        identity: &str,
        f: &mut dyn FnMut(Option<AttemptRecord>) -> Option<AttemptRecord>,
    ) -> Result<Option<AttemptRecord>> {
        let mut ledger = self.lock();
        let current = ledger.records.get(identity).cloned();
        let updated = f(current.clone());
        if updated == current {
            return Ok(updated);
        }

        match &updated {
            Some(record) => {
                ledger.records.insert(identity.to_string(), record.clone());
            }
            None => {
                ledger.records.remove(identity);
            }
        }
        self.persist(&ledger)?;
        Ok(updated)
    }

    fn retain(&self, keep: &mut dyn FnMut(&AttemptRecord) -> bool) -> Result<usize> {
        let mut ledger = self.lock();
        let before = ledger.records.len();
        ledger.records.retain(|_, record| keep(record));
        let dropped = before - ledger.records.len();
        if dropped > 0 {
            self.persist(&ledger)?;
        }
        Ok(dropped)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.lock().len())
    }
}
