//! Record persistence
//!
//! [`RecordStore`] is the seam the launcher, stopper and reconciler use to read
//! and mutate records. Updates are expressed as a [`RecordUpdate`] so that a
//! status change and the fields that go with it land together or not at all.
//!
//! [`MemoryRecordStore`] keeps records for the life of the process;
//! [`SqliteRecordStore`] keeps them in a database file across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::record::{JobStatus, Record, RecordId};
use crate::{Error, Result};

mod sqlite;

pub use sqlite::SqliteRecordStore;

/// A set of field changes applied atomically to one record
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordUpdate {
    status: Option<JobStatus>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    output_file_url: Option<String>,
}

impl RecordUpdate {
    /// Empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `status` (must be a permitted transition)
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set `start_time`
    pub fn start_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.start_time = at;
        self
    }

    /// Set `stop_time`
    pub fn stop_time(mut self, at: DateTime<Utc>) -> Self {
        self.stop_time = Some(at);
        self
    }

    /// Set `output_file_url`; only valid together with or after `Succeeded`
    pub fn output_file_url(mut self, url: impl Into<String>) -> Self {
        self.output_file_url = Some(url.into());
        self
    }

    /// Apply to `record`. On error `record` may be partially modified, so
    /// callers apply to a copy.
    pub fn apply(&self, record: &mut Record) -> Result<()> {
        if let Some(status) = self.status {
            record.transition(status)?;
        }
        if let Some(url) = &self.output_file_url {
            if record.status != JobStatus::Succeeded {
                return Err(Error::validation(
                    "output_file_url",
                    format!("cannot publish output while {}", record.status),
                ));
            }
            record.output_file_url = Some(url.clone());
        }
        if let Some(at) = self.start_time {
            record.start_time = Some(at);
        }
        if let Some(at) = self.stop_time {
            record.stop_time = Some(at);
        }
        Ok(())
    }
}

/// Persistence for job records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record; fails with [`Error::NameTaken`] if the name exists
    async fn insert(&self, record: Record) -> Result<Record>;

    /// Fetch by id
    async fn get(&self, id: RecordId) -> Result<Option<Record>>;

    /// Fetch by unique name
    async fn find_by_name(&self, name: &str) -> Result<Option<Record>>;

    /// Atomically apply `update` and return the new state
    async fn update(&self, id: RecordId, update: RecordUpdate) -> Result<Record>;

    /// All records, optionally filtered by status, oldest first
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Record>>;
}

/// In-process record store
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<RecordId, Record>,
    names: DashMap<String, RecordId>,
}

impl MemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a record, without going through the async trait
    pub fn snapshot(&self, id: RecordId) -> Option<Record> {
        self.records.get(&id).map(|r| r.value().clone())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: Record) -> Result<Record> {
        match self.names.entry(record.name.clone()) {
            Entry::Occupied(_) => Err(Error::NameTaken { name: record.name }),
            Entry::Vacant(slot) => {
                self.records.insert(record.id, record.clone());
                slot.insert(record.id);
                Ok(record)
            }
        }
    }

    async fn get(&self, id: RecordId) -> Result<Option<Record>> {
        Ok(self.snapshot(id))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Record>> {
        let Some(id) = self.names.get(name).map(|id| *id.value()) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn update(&self, id: RecordId, update: RecordUpdate) -> Result<Record> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::RecordNotFound { id: id.to_string() })?;

        let mut next = entry.value().clone();
        update.apply(&mut next)?;
        *entry.value_mut() = next.clone();
        Ok(next)
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        Ok(records)
    }
}
