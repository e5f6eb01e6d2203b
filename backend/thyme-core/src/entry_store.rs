// src/entry_store.rs

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::time_entries::{entries_in_range, TimeEntry};

pub const DEFAULT_ENTRIES_FILE: &str = "time_entries.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Time entry not found: {0}")]
    NotFound(String),

    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn io_context<S: Into<String>>(source: std::io::Error, context: S) -> StoreError {
    StoreError::Io {
        source,
        context: context.into(),
    }
}

/// Field updates for an existing entry. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPatch {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub date: Option<String>,
    pub hours: Option<f64>,
    pub notes: Option<String>,
    pub is_billable: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntrySnapshot {
    entries: Vec<TimeEntry>,
}

/// Local cache of time entries, written to disk after every mutation.
#[derive(Debug)]
pub struct EntryStore {
    path: PathBuf,
    entries: Vec<TimeEntry>,
}

impl EntryStore {
    /// Loads the snapshot at `path`. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let entries = if path.exists() {
            let json_string = fs::read_to_string(path)
                .map_err(|e| io_context(e, format!("Failed to read entries file: {:?}", path)))?;
            let snapshot: EntrySnapshot = serde_json::from_str(&json_string)?;
            info!("Loaded {} time entries from {:?}", snapshot.entries.len(), path);
            snapshot.entries
        } else {
            info!("Entries file {:?} not found, starting empty.", path);
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    fn write_snapshot(&self, entries: &[TimeEntry]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                io_context(e, format!("Failed to create directory for entries: {:?}", parent))
            })?;
        }
        let snapshot = EntrySnapshot {
            entries: entries.to_vec(),
        };
        let json_string = serde_json::to_string_pretty(&snapshot)?;
        let mut file = File::create(&self.path).map_err(|e| {
            io_context(e, format!("Failed to create entries file: {:?}", self.path))
        })?;
        file.write_all(json_string.as_bytes())
            .map_err(|e| io_context(e, format!("Failed to write entries file: {:?}", self.path)))?;
        debug!("Saved {} entries to {:?}", entries.len(), self.path);
        Ok(())
    }

    /// Saves `next` and only then makes it the in-memory state, so a failed
    /// write leaves the store as it was.
    fn commit(&mut self, next: Vec<TimeEntry>) -> Result<(), StoreError> {
        self.write_snapshot(&next)?;
        self.entries = next;
        Ok(())
    }

    fn position(&self, id: &str) -> Result<usize, StoreError> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn add(&mut self, entry: TimeEntry) -> Result<TimeEntry, StoreError> {
        let mut next = self.entries.clone();
        next.push(entry.clone());
        self.commit(next)?;
        Ok(entry)
    }

    pub fn update(
        &mut self,
        id: &str,
        patch: EntryPatch,
        now: DateTime<Utc>,
    ) -> Result<TimeEntry, StoreError> {
        let index = self.position(id)?;
        let mut entry = self.entries[index].clone();

        if let Some(project_id) = patch.project_id {
            entry.project_id = project_id;
        }
        if let Some(task_id) = patch.task_id {
            entry.task_id = Some(task_id);
        }
        if let Some(date) = patch.date {
            entry.date = date;
        }
        if let Some(hours) = patch.hours {
            entry.hours = hours;
        }
        if let Some(notes) = patch.notes {
            entry.notes = Some(notes);
        }
        if let Some(is_billable) = patch.is_billable {
            entry.is_billable = is_billable;
        }
        entry.mark_pending(now);

        let mut next = self.entries.clone();
        next[index] = entry.clone();
        self.commit(next)?;
        Ok(entry)
    }

    pub fn remove(&mut self, id: &str) -> Result<TimeEntry, StoreError> {
        let index = self.position(id)?;
        let mut next = self.entries.clone();
        let removed = next.remove(index);
        self.commit(next)?;
        Ok(removed)
    }

    /// Records the outcome of pushing `sent` to the ERP. The ERP booking is
    /// always kept. The sync status only lands when the entry is unchanged
    /// since `sent` was read; returns whether it did.
    pub fn record_push(&mut self, sent: &TimeEntry, pushed: TimeEntry) -> Result<bool, StoreError> {
        let Some(index) = self.entries.iter().position(|e| e.id == sent.id) else {
            if pushed.booking.is_some() {
                warn!("Entry {} was removed while syncing; its ERP hours stay booked", sent.id);
            }
            return Ok(false);
        };

        let mut entry = self.entries[index].clone();
        let unchanged = entry.updated_at == sent.updated_at;
        entry.booking = pushed.booking;
        if pushed.bc_line_id.is_some() {
            entry.bc_line_id = pushed.bc_line_id;
        }
        if unchanged {
            entry.sync_status = pushed.sync_status;
        }

        let mut next = self.entries.clone();
        next[index] = entry;
        self.commit(next)?;
        Ok(unchanged)
    }

    pub fn get(&self, id: &str) -> Option<&TimeEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn list(&self) -> &[TimeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_week(&self, start: NaiveDate) -> Vec<TimeEntry> {
        entries_in_range(&self.entries, start, start + Duration::days(6))
    }

    pub fn pending(&self) -> Vec<TimeEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_pending())
            .cloned()
            .collect()
    }

    /// Pending entries plus those whose last push failed.
    pub fn unsynced(&self) -> Vec<TimeEntry> {
        self.entries
            .iter()
            .filter(|e| e.needs_sync())
            .cloned()
            .collect()
    }
}
