//! Durable JobRecord store.
//!
//! One pretty-printed JSON document per job under the data directory
//! (`job_<id>.json`), with an in-memory concurrent map as the read path.
//! Writes go to a temp file and are renamed into place, so an unclean exit
//! never leaves a torn record. `update` holds the per-id map entry for the
//! duration of the read-modify-write-persist cycle, serializing concurrent
//! callers for the same id while leaving other ids untouched.

use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::job::{JobRecord, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job already exists: {0}")]
    AlreadyExists(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Ordering for `list`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListOrder {
    /// Most recently submitted first.
    #[default]
    Submitted,
    /// Running first, then pending, then terminal; recency within a class.
    StatusPriority,
    /// Longest runtime first; jobs without a runtime last.
    Runtime,
}

impl std::str::FromStr for ListOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "status" => Ok(Self::StatusPriority),
            "runtime" => Ok(Self::Runtime),
            other => Err(format!("unknown list order: {other}")),
        }
    }
}

pub struct JobStore {
    dir: PathBuf,
    records: DashMap<String, JobRecord>,
}

impl JobStore {
    /// Open the store at `dir`, loading every persisted record. Records that
    /// fail to parse are skipped with a warning rather than failing startup.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let records = DashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("job_") || !name.ends_with(".json") {
                continue;
            }
            match fs::read(&path).map_err(StoreError::from).and_then(|bytes| {
                serde_json::from_slice::<JobRecord>(&bytes).map_err(StoreError::from)
            }) {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }

        tracing::debug!(dir = %dir.display(), count = records.len(), "Job store opened");
        Ok(Self { dir, records })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("job_{id}.json"))
    }

    fn persist(&self, record: &JobRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Insert a new record. Fails if the id is already taken.
    pub fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        match self.records.entry(record.id.clone()) {
            dashmap::Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.id)),
            dashmap::Entry::Vacant(slot) => {
                self.persist(&record)?;
                slot.insert(record);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Atomic read-modify-write. The mutation is applied to a copy, persisted,
    /// and only then committed to the in-memory map, so readers never observe
    /// a state that did not reach disk.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<JobRecord, StoreError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut updated = entry.clone();
        mutate(&mut updated);
        self.persist(&updated)?;
        *entry = updated.clone();
        Ok(updated)
    }

    pub fn list(&self, filter: Option<JobStatus>, order: ListOrder) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .records
            .iter()
            .filter(|r| filter.is_none_or(|s| r.status == s))
            .map(|r| r.clone())
            .collect();

        match order {
            ListOrder::Submitted => {
                records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(a.id.cmp(&b.id)));
            }
            ListOrder::StatusPriority => {
                records.sort_by(|a, b| {
                    status_rank(a.status)
                        .cmp(&status_rank(b.status))
                        .then(b.submitted_at.cmp(&a.submitted_at))
                        .then(a.id.cmp(&b.id))
                });
            }
            ListOrder::Runtime => {
                records.sort_by(|a, b| match (a.runtime(), b.runtime()) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => b.submitted_at.cmp(&a.submitted_at),
                });
            }
        }

        records
    }

    /// Remove a record from the map and from disk.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn status_rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Running => 0,
        JobStatus::Pending => 1,
        _ => 2,
    }
}
