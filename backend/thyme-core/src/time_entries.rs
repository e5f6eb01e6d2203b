// src/time_entries.rs

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error(String),
}

/// Where an entry's hours currently sit in the ERP: one day detail of one
/// timesheet line, and how much of that detail's quantity this entry contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BcBooking {
    pub time_sheet_no: String,
    pub line_id: String,
    pub line_no: i64,
    pub date: String,
    /// In the resource's native unit.
    pub quantity: f64,
}

impl BcBooking {
    pub fn same_slot(&self, time_sheet_no: &str, line_no: i64, date: &str) -> bool {
        self.time_sheet_no == time_sheet_no && self.line_no == line_no && self.date == date
    }
}

/// A locally logged block of time. The ERP timesheet line is the system of
/// record; this is the cached copy tagged with how far it has been reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub project_id: String,
    pub task_id: Option<String>,
    pub user_id: String,
    /// ISO day (`YYYY-MM-DD`) in the user's local calendar.
    pub date: String,
    pub hours: f64,
    pub notes: Option<String>,
    pub is_billable: bool,
    pub is_running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bc_line_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking: Option<BcBooking>,
}

pub fn generate_entry_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("te_{}", suffix)
}

impl TimeEntry {
    pub fn new(
        project_id: &str,
        user_id: &str,
        date: NaiveDate,
        hours: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_entry_id(),
            project_id: project_id.to_string(),
            task_id: None,
            user_id: user_id.to_string(),
            date: date.format(DATE_FORMAT).to_string(),
            hours,
            notes: None,
            is_billable: true,
            is_running: false,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
            bc_line_id: None,
            booking: None,
        }
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn notes(mut self, notes: Option<&str>) -> Self {
        self.notes = notes.map(String::from);
        self
    }

    pub fn billable(mut self, is_billable: bool) -> Self {
        self.is_billable = is_billable;
        self
    }

    pub fn parsed_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date, DATE_FORMAT).ok()
    }

    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Pending;
        self.updated_at = now;
    }

    pub fn mark_synced(&mut self, bc_line_id: &str) {
        self.sync_status = SyncStatus::Synced;
        self.bc_line_id = Some(bc_line_id.to_string());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.sync_status = SyncStatus::Error(message.into());
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// Pending, or failed on an earlier attempt.
    pub fn needs_sync(&self) -> bool {
        !matches!(self.sync_status, SyncStatus::Synced)
    }
}

// --- Aggregation ---

pub fn calculate_total_hours(entries: &[TimeEntry]) -> f64 {
    entries.iter().map(|e| e.hours).sum()
}

/// Sums hours per `date` string. Days without entries are absent, not zero;
/// use [`week_grid`] when a full week is needed.
pub fn get_daily_totals(entries: &[TimeEntry]) -> HashMap<String, f64> {
    let mut totals: HashMap<String, f64> = HashMap::new();
    for entry in entries {
        *totals.entry(entry.date.clone()).or_insert(0.0) += entry.hours;
    }
    totals
}

// --- Week navigation ---

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

pub fn week_days(start: NaiveDate) -> [NaiveDate; 7] {
    std::array::from_fn(|offset| start + Duration::days(offset as i64))
}

pub fn previous_week(start: NaiveDate) -> NaiveDate {
    week_start(start) - Duration::days(7)
}

pub fn next_week(start: NaiveDate) -> NaiveDate {
    week_start(start) + Duration::days(7)
}

/// Daily totals for the seven days starting at `start`, zero-filled.
pub fn week_grid(entries: &[TimeEntry], start: NaiveDate) -> Vec<(String, f64)> {
    let totals = get_daily_totals(entries);
    week_days(start)
        .iter()
        .map(|day| {
            let key = day.format(DATE_FORMAT).to_string();
            let hours = totals.get(&key).copied().unwrap_or(0.0);
            (key, hours)
        })
        .collect()
}

/// Entries whose date falls within `from..=to`. Entries with unparseable dates are skipped.
pub fn entries_in_range(entries: &[TimeEntry], from: NaiveDate, to: NaiveDate) -> Vec<TimeEntry> {
    entries
        .iter()
        .filter(|e| e.parsed_date().is_some_and(|d| d >= from && d <= to))
        .cloned()
        .collect()
}

pub fn round_hours(hours: f64) -> f64 {
    (hours * 100.0).round() / 100.0
}
