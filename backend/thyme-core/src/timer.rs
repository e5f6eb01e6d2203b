// src/timer.rs

use chrono::{DateTime, FixedOffset, Local, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::time_entries::{round_hours, TimeEntry};

pub const DEFAULT_TIMER_FILE: &str = "timer.json";

#[derive(Error, Debug)]
pub enum TimerError {
    #[error("A timer is already running for project {0}")]
    AlreadyRunning(String),

    #[error("No timer is running")]
    NotRunning,

    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),
}

fn io_context<S: Into<String>>(source: std::io::Error, context: S) -> TimerError {
    TimerError::Io {
        source,
        context: context.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTimer {
    pub project_id: String,
    pub task_id: Option<String>,
    pub notes: Option<String>,
    pub is_billable: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TimerSnapshot {
    running: Option<RunningTimer>,
}

/// The single running timer, persisted so it survives a restart.
#[derive(Debug)]
pub struct TimerStore {
    path: PathBuf,
    offset: FixedOffset,
    running: Option<RunningTimer>,
}

impl TimerStore {
    pub fn load(path: &Path) -> Result<Self, TimerError> {
        let snapshot = if path.exists() {
            let json_string = fs::read_to_string(path)
                .map_err(|e| io_context(e, format!("Failed to read timer file: {:?}", path)))?;
            match serde_json::from_str::<TimerSnapshot>(&json_string) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Discarding unreadable timer file {:?}: {}", path, e);
                    TimerSnapshot::default()
                }
            }
        } else {
            TimerSnapshot::default()
        };

        if let Some(running) = &snapshot.running {
            info!(
                "Restored running timer for project {} started at {}",
                running.project_id, running.started_at
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            offset: Local::now().offset().fix(),
            running: snapshot.running,
        })
    }

    /// Sets the UTC offset used to pick the calendar day of a stopped entry.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// Writes `running` to disk; callers update memory only after this succeeds.
    fn save(&self, running: Option<&RunningTimer>) -> Result<(), TimerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                io_context(e, format!("Failed to create directory for timer: {:?}", parent))
            })?;
        }
        let snapshot = TimerSnapshot {
            running: running.cloned(),
        };
        let json_string = serde_json::to_string_pretty(&snapshot)?;
        let mut file = File::create(&self.path)
            .map_err(|e| io_context(e, format!("Failed to create timer file: {:?}", self.path)))?;
        file.write_all(json_string.as_bytes())
            .map_err(|e| io_context(e, format!("Failed to write timer file: {:?}", self.path)))?;
        Ok(())
    }

    pub fn running(&self) -> Option<&RunningTimer> {
        self.running.as_ref()
    }

    pub fn start(
        &mut self,
        project_id: &str,
        task_id: Option<&str>,
        notes: Option<&str>,
        is_billable: bool,
        now: DateTime<Utc>,
    ) -> Result<RunningTimer, TimerError> {
        if let Some(running) = &self.running {
            return Err(TimerError::AlreadyRunning(running.project_id.clone()));
        }
        let timer = RunningTimer {
            project_id: project_id.to_string(),
            task_id: task_id.map(String::from),
            notes: notes.map(String::from),
            is_billable,
            started_at: now,
        };
        self.save(Some(&timer))?;
        self.running = Some(timer.clone());
        info!("Timer started for project {}", project_id);
        Ok(timer)
    }

    /// Elapsed seconds of the running timer, 0 when idle.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        self.running
            .as_ref()
            .map(|t| (now - t.started_at).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Stops the timer and turns the elapsed time into a pending entry dated
    /// by the local day the timer was started on.
    pub fn stop(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<TimeEntry, TimerError> {
        let elapsed = self.elapsed_secs(now);
        if self.running.is_none() {
            return Err(TimerError::NotRunning);
        }
        self.save(None)?;
        let timer = self.running.take().ok_or(TimerError::NotRunning)?;

        let local_day = timer.started_at.with_timezone(&self.offset).date_naive();
        let hours = round_hours(elapsed as f64 / 3600.0);
        let mut entry = TimeEntry::new(&timer.project_id, user_id, local_day, hours, now)
            .notes(timer.notes.as_deref())
            .billable(timer.is_billable);
        entry.task_id = timer.task_id;
        info!(
            "Timer stopped for project {}: {} hours on {}",
            entry.project_id, entry.hours, entry.date
        );
        Ok(entry)
    }

    pub fn discard(&mut self) -> Result<(), TimerError> {
        if self.running.is_some() {
            self.save(None)?;
            self.running = None;
        }
        Ok(())
    }
}
