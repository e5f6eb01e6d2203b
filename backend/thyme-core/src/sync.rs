// src/sync.rs

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::approvals::{self, ApprovalDecision, ApprovalItem};
use crate::bc_client::{
    BcClient, BcError, BcJobPlanningLine, BcTimeSheet, BcTimeSheetDetail, BcTimeSheetLine,
    NewJobPlanningLine, NewTimeSheetLine,
};
use crate::entry_store::{EntryStore, StoreError};
use crate::time_entries::{
    calculate_total_hours, round_hours, week_grid, week_start, BcBooking, SyncStatus, TimeEntry,
    DATE_FORMAT,
};
use crate::timesheet_status::{resolve_sheet, TimesheetDisplayStatus};
use crate::uom::{self, convert_from_hours, convert_to_hours, UomConversionMap};

pub const LINE_STATUS_OPEN: &str = "Open";
pub const LINE_STATUS_SUBMITTED: &str = "Submitted";
const JOB_LINE_TYPE: &str = "Job";
const RESOURCE_LINE_TYPE: &str = "Resource";
const QUANTITY_EPSILON: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Business Central request failed")]
    Bc(#[from] BcError),

    #[error("Local store error")]
    Store(#[from] StoreError),

    #[error("No time sheet for resource {resource_no} covers {date}")]
    NoTimeSheet { resource_no: String, date: String },

    #[error("Invalid time entry: {0}")]
    InvalidEntry(String),

    #[error("Not allowed: {0}")]
    Forbidden(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayTotal {
    pub date: String,
    pub hours: f64,
}

/// One resource's week as the ERP sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekView {
    pub resource_no: String,
    pub week_start: String,
    pub sheet: Option<BcTimeSheet>,
    pub status: Option<TimesheetDisplayStatus>,
    pub entries: Vec<TimeEntry>,
    pub grid: Vec<DayTotal>,
    pub total_hours: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TimesheetSynchronizer {
    bc_client: Arc<BcClient>,
}

impl TimesheetSynchronizer {
    pub fn new(bc_client: Arc<BcClient>) -> Self {
        Self { bc_client }
    }

    pub fn client(&self) -> &BcClient {
        &self.bc_client
    }

    /// Builds the conversion table from the current unit-of-measure records.
    pub async fn load_conversions(&self) -> Result<UomConversionMap, SyncError> {
        let records = self.bc_client.get_resource_units_of_measure().await?;
        let map = uom::build(&records);
        debug!("Built UOM conversion map with {} factors", map.len());
        Ok(map)
    }

    async fn find_sheet(
        &self,
        resource_no: &str,
        date: NaiveDate,
    ) -> Result<Option<BcTimeSheet>, SyncError> {
        let date_str = date.format(DATE_FORMAT).to_string();
        let sheets = self.bc_client.get_time_sheets(resource_no).await?;
        Ok(sheets.into_iter().find(|s| s.covers(&date_str)))
    }

    async fn require_sheet(
        &self,
        resource_no: &str,
        date: NaiveDate,
    ) -> Result<BcTimeSheet, SyncError> {
        self.find_sheet(resource_no, date)
            .await?
            .ok_or_else(|| SyncError::NoTimeSheet {
                resource_no: resource_no.to_string(),
                date: date.format(DATE_FORMAT).to_string(),
            })
    }

    pub async fn fetch_week(
        &self,
        resource_no: &str,
        date: NaiveDate,
    ) -> Result<WeekView, SyncError> {
        let start = week_start(date);
        info!("Fetching week of {} for resource {}", start, resource_no);

        let mut view = WeekView {
            resource_no: resource_no.to_string(),
            week_start: start.format(DATE_FORMAT).to_string(),
            sheet: None,
            status: None,
            entries: Vec::new(),
            grid: Vec::new(),
            total_hours: 0.0,
        };

        if let Some(sheet) = self.find_sheet(resource_no, start).await? {
            let map = self.load_conversions().await?;
            let lines = self.bc_client.get_time_sheet_lines(&sheet.no).await?;
            let details = self.bc_client.get_time_sheet_details(&sheet.no).await?;
            view.entries = entries_from_sheet(resource_no, &lines, &details, &map, Utc::now());
            view.status = Some(resolve_sheet(&sheet));
            view.sheet = Some(sheet);
        } else {
            debug!("No time sheet covers {} for {}", start, resource_no);
        }

        view.grid = week_grid(&view.entries, start)
            .into_iter()
            .map(|(date, hours)| DayTotal { date, hours })
            .collect();
        view.total_hours = round_hours(calculate_total_hours(&view.entries));
        Ok(view)
    }

    /// Pushes one entry to its covering time sheet. Failures are recorded on
    /// the returned entry rather than returned. The returned entry's booking
    /// always reflects what the ERP holds, including after a partial failure.
    pub async fn push_entry(&self, resource_no: &str, entry: &TimeEntry) -> TimeEntry {
        let mut pushed = entry.clone();
        match self.try_push(resource_no, &mut pushed).await {
            Ok(line_id) => {
                info!("Entry {} synced to line {}", entry.id, line_id);
                pushed.mark_synced(&line_id);
            }
            Err(e) => {
                warn!("Entry {} failed to sync: {}", entry.id, e);
                pushed.mark_error(error_message(&e));
            }
        }
        pushed
    }

    async fn try_push(&self, resource_no: &str, entry: &mut TimeEntry) -> Result<String, SyncError> {
        let date = entry
            .parsed_date()
            .ok_or_else(|| SyncError::InvalidEntry(format!("bad date '{}'", entry.date)))?;
        if entry.hours < 0.0 {
            return Err(SyncError::InvalidEntry(format!("negative hours {}", entry.hours)));
        }

        let sheet = self.require_sheet(resource_no, date).await?;
        let lines = self.bc_client.get_time_sheet_lines(&sheet.no).await?;
        let line = self.line_for_entry(&sheet, &lines, entry).await?;

        let map = self.load_conversions().await?;
        let quantity = convert_from_hours(resource_no, entry.hours, &map);

        // Other entries may share the detail, so only this entry's share moves.
        let mut delta = quantity;
        if let Some(previous) = entry.booking.clone() {
            if previous.same_slot(&sheet.no, line.line_no, &entry.date) {
                delta -= previous.quantity;
            } else {
                debug!(
                    "Entry {} moved off {} line {} on {}",
                    entry.id, previous.time_sheet_no, previous.line_no, previous.date
                );
                self.adjust_detail(
                    &previous.time_sheet_no,
                    previous.line_no,
                    &previous.date,
                    -previous.quantity,
                )
                .await?;
                entry.booking = None;
            }
        }

        self.adjust_detail(&sheet.no, line.line_no, &entry.date, delta)
            .await?;
        entry.booking = Some(BcBooking {
            time_sheet_no: sheet.no.clone(),
            line_id: line.id.clone(),
            line_no: line.line_no,
            date: entry.date.clone(),
            quantity,
        });
        Ok(line.id)
    }

    /// Adds `delta` (native units) to the quantity of one day detail, creating
    /// the detail when needed. Totals never drop below zero.
    async fn adjust_detail(
        &self,
        time_sheet_no: &str,
        line_no: i64,
        date: &str,
        delta: f64,
    ) -> Result<(), SyncError> {
        if delta.abs() < QUANTITY_EPSILON {
            return Ok(());
        }
        let existing = self
            .bc_client
            .find_time_sheet_detail(time_sheet_no, line_no, date)
            .await?;
        match existing {
            Some(BcTimeSheetDetail {
                id: Some(detail_id),
                quantity,
                ..
            }) => {
                let total = round_quantity((quantity + delta).max(0.0));
                self.bc_client
                    .set_time_sheet_detail_quantity(&detail_id, total)
                    .await?;
            }
            _ if delta > 0.0 => {
                let detail = BcTimeSheetDetail {
                    id: None,
                    time_sheet_no: time_sheet_no.to_string(),
                    time_sheet_line_no: line_no,
                    date: date.to_string(),
                    quantity: round_quantity(delta),
                };
                self.bc_client.create_time_sheet_detail(&detail).await?;
            }
            _ => debug!(
                "Nothing booked on {} line {} on {}, nothing to release",
                time_sheet_no, line_no, date
            ),
        }
        Ok(())
    }

    /// Reuses the entry's linked line while it still carries the entry's job
    /// and task, else an open line for them, else creates one. Linked lines
    /// are never re-pointed since other days on them belong to other entries.
    async fn line_for_entry(
        &self,
        sheet: &BcTimeSheet,
        lines: &[BcTimeSheetLine],
        entry: &TimeEntry,
    ) -> Result<BcTimeSheetLine, SyncError> {
        if let Some(linked) = entry
            .bc_line_id
            .as_deref()
            .and_then(|id| lines.iter().find(|l| l.id == id))
            .filter(|l| line_matches(l, entry))
        {
            return Ok(linked.clone());
        }

        if let Some(existing) = lines
            .iter()
            .find(|l| l.status == LINE_STATUS_OPEN && line_matches(l, entry))
        {
            return Ok(existing.clone());
        }

        let new_line = NewTimeSheetLine {
            time_sheet_no: sheet.no.clone(),
            line_type: JOB_LINE_TYPE.to_string(),
            job_no: entry.project_id.clone(),
            job_task_no: entry.task_id.clone(),
            description: entry.notes.clone(),
            chargeable: entry.is_billable,
        };
        Ok(self.bc_client.create_time_sheet_line(&new_line).await?)
    }

    /// Pushes every entry not yet synced, failed ones included, and records
    /// the outcome in `store`. Entries edited while the push was in flight
    /// stay pending with their new values.
    pub async fn sync_pending(
        &self,
        store: &Mutex<EntryStore>,
        resource_no: &str,
    ) -> Result<SyncReport, SyncError> {
        let unsynced = store.lock().await.unsynced();
        if unsynced.is_empty() {
            debug!("No pending entries to sync");
            return Ok(SyncReport::default());
        }
        info!("Syncing {} unsynced entries for {}", unsynced.len(), resource_no);

        let mut report = SyncReport::default();
        for entry in unsynced {
            let pushed = self.push_entry(resource_no, &entry).await;
            match pushed.sync_status {
                SyncStatus::Synced => report.synced += 1,
                _ => report.failed += 1,
            }

            let recorded = store.lock().await.record_push(&entry, pushed)?;
            if !recorded {
                debug!("Entry {} changed or vanished during sync", entry.id);
            }
        }

        info!(
            "Pending sync finished: {} synced, {} failed",
            report.synced, report.failed
        );
        Ok(report)
    }

    /// Submits every open line of the sheet covering the week. Returns the number submitted.
    pub async fn submit_week(&self, resource_no: &str, date: NaiveDate) -> Result<usize, SyncError> {
        let start = week_start(date);
        let sheet = self.require_sheet(resource_no, start).await?;
        let lines = self.bc_client.get_time_sheet_lines(&sheet.no).await?;

        let mut submitted = 0;
        for line in lines.iter().filter(|l| l.status == LINE_STATUS_OPEN) {
            self.bc_client.submit_time_sheet_line(&line.id).await?;
            submitted += 1;
        }
        info!("Submitted {} lines on time sheet {}", submitted, sheet.no);
        Ok(submitted)
    }

    /// Plans `hours` of a resource on a job task, in the resource's native unit.
    pub async fn plan_hours(
        &self,
        job_no: &str,
        job_task_no: &str,
        resource_no: &str,
        hours: f64,
        date: NaiveDate,
    ) -> Result<BcJobPlanningLine, SyncError> {
        let map = self.load_conversions().await?;
        let quantity = convert_from_hours(resource_no, hours, &map);
        info!(
            "Planning {} hours ({} native units) of {} on {}/{}",
            hours, quantity, resource_no, job_no, job_task_no
        );
        let line = NewJobPlanningLine {
            job_no: job_no.to_string(),
            job_task_no: job_task_no.to_string(),
            line_type: RESOURCE_LINE_TYPE.to_string(),
            no: resource_no.to_string(),
            quantity,
            planning_date: date.format(DATE_FORMAT).to_string(),
        };
        Ok(self.bc_client.create_job_planning_line(&line).await?)
    }

    pub async fn pending_approvals(&self, user_id: &str) -> Result<Vec<ApprovalItem>, SyncError> {
        let sheets = self.bc_client.get_time_sheets_for_approver(user_id).await?;
        Ok(approvals::approvable(user_id, sheets))
    }

    /// Approves or rejects every submitted line of a sheet. Returns the number of lines decided.
    pub async fn decide(
        &self,
        user_id: &str,
        time_sheet_no: &str,
        decision: ApprovalDecision,
    ) -> Result<usize, SyncError> {
        let sheet = self.bc_client.get_time_sheet(time_sheet_no).await?;
        if !approvals::can_approve(user_id, &sheet) {
            return Err(SyncError::Forbidden(format!(
                "{} cannot approve time sheet {}",
                user_id, time_sheet_no
            )));
        }

        let lines = self.bc_client.get_time_sheet_lines(time_sheet_no).await?;
        let mut decided = 0;
        for line in lines.iter().filter(|l| l.status == LINE_STATUS_SUBMITTED) {
            self.bc_client
                .apply_line_action(&line.id, decision.line_action())
                .await?;
            decided += 1;
        }
        info!(
            "{} applied {:?} to {} lines of time sheet {}",
            user_id, decision, decided, time_sheet_no
        );
        Ok(decided)
    }
}

fn line_matches(line: &BcTimeSheetLine, entry: &TimeEntry) -> bool {
    line.job_no.as_deref() == Some(entry.project_id.as_str())
        && line.job_task_no.as_deref() == entry.task_id.as_deref()
}

fn round_quantity(quantity: f64) -> f64 {
    (quantity * 100_000.0).round() / 100_000.0
}

fn error_message(error: &SyncError) -> String {
    match error {
        SyncError::Bc(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

/// One entry per non-zero day detail, with quantities converted to hours.
pub fn entries_from_sheet(
    resource_no: &str,
    lines: &[BcTimeSheetLine],
    details: &[BcTimeSheetDetail],
    map: &UomConversionMap,
    now: DateTime<Utc>,
) -> Vec<TimeEntry> {
    let mut entries = Vec::new();
    for detail in details.iter().filter(|d| d.quantity != 0.0) {
        let Some(line) = lines.iter().find(|l| l.line_no == detail.time_sheet_line_no) else {
            warn!(
                "Detail on {} references unknown line {}",
                detail.time_sheet_no, detail.time_sheet_line_no
            );
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(&detail.date, DATE_FORMAT) else {
            warn!("Skipping detail with unparseable date '{}'", detail.date);
            continue;
        };

        let hours = round_hours(convert_to_hours(resource_no, detail.quantity, map));
        let project_id = line.job_no.clone().unwrap_or_default();
        let mut entry = TimeEntry::new(&project_id, resource_no, date, hours, now)
            .notes(line.description.as_deref())
            .billable(line.chargeable);
        entry.id = format!("{}_{}", line.id, detail.date);
        entry.task_id = line.job_task_no.clone();
        entry.mark_synced(&line.id);
        entries.push(entry);
    }
    entries.sort_by(|a, b| a.date.cmp(&b.date));
    entries
}

/// Pushes pending entries on a fixed interval until the process exits.
pub async fn run_pending_sync(
    synchronizer: Arc<TimesheetSynchronizer>,
    store: Arc<Mutex<EntryStore>>,
    resource_no: String,
    interval: Duration,
) {
    info!(
        "Starting periodic pending-entry sync for {} every {}s",
        resource_no,
        interval.as_secs()
    );
    loop {
        tokio::time::sleep(interval).await;
        match synchronizer.sync_pending(&store, &resource_no).await {
            Ok(report) if report.failed > 0 => {
                warn!("Periodic sync left {} entries unsynced", report.failed)
            }
            Ok(_) => {}
            Err(e) => error!("Periodic pending-entry sync failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bc_client::{BcConfig, StaticTokenSource};
    use crate::entry_store::{EntryPatch, DEFAULT_ENTRIES_FILE};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PREFIX: &str = "/tenant/sandbox/api/thyme/timesheets/v1.0/companies(c1)";

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, DATE_FORMAT).unwrap()
    }

    fn endpoint(entity: &str) -> String {
        format!("{}{}", PREFIX, entity)
    }

    fn synchronizer(server: &MockServer, cache_dir: &TempDir) -> TimesheetSynchronizer {
        let client = BcClient::new(
            BcConfig::for_tests(&server.uri(), cache_dir.path()),
            Arc::new(StaticTokenSource::new("test-token")),
        )
        .unwrap();
        TimesheetSynchronizer::new(Arc::new(client))
    }

    fn line(id: &str, line_no: i64, job: &str, task: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "timeSheetNo": "TS001",
            "lineNo": line_no,
            "type": "Job",
            "jobNo": job,
            "jobTaskNo": task,
            "status": status,
            "chargeable": true
        })
    }

    async fn mount_sheet(server: &MockServer, submitted: bool) {
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheets")))
            .and(query_param("$filter", "resourceNo eq 'R1'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {
                        "no": "TS000",
                        "resourceNo": "R1",
                        "startingDate": "2023-12-25",
                        "endingDate": "2023-12-31",
                        "approvedExists": true
                    },
                    {
                        "no": "TS001",
                        "resourceNo": "R1",
                        "startingDate": "2024-01-01",
                        "endingDate": "2024-01-07",
                        "openExists": true,
                        "submittedExists": submitted
                    }
                ]
            })))
            .mount(server)
            .await;
    }

    async fn mount_units(server: &MockServer, day_factor: f64) {
        Mock::given(method("GET"))
            .and(path(endpoint("/resourceUnitsOfMeasure")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "resourceNo": "R1", "code": "HOUR", "qtyPerUnitOfMeasure": day_factor }]
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn details_become_synced_entries_in_hours() {
        let lines = vec![BcTimeSheetLine {
            id: "line-1".into(),
            time_sheet_no: "TS001".into(),
            line_no: 10000,
            line_type: "Job".into(),
            job_no: Some("JOB1".into()),
            job_task_no: Some("100".into()),
            description: Some("build".into()),
            status: "Open".into(),
            chargeable: false,
            total_quantity: 1.5,
        }];
        let detail = |date: &str, quantity: f64, line_no: i64| BcTimeSheetDetail {
            id: None,
            time_sheet_no: "TS001".into(),
            time_sheet_line_no: line_no,
            date: date.into(),
            quantity,
        };
        let details = vec![
            detail("2024-01-03", 0.5, 10000),
            detail("2024-01-02", 1.0, 10000),
            detail("2024-01-04", 0.0, 10000),
            detail("2024-01-05", 1.0, 99999),
        ];
        let mut map = UomConversionMap::new();
        map.insert("R1", "HOUR", 8.0);

        let entries = entries_from_sheet("R1", &lines, &details, &map, Utc::now());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].date, "2024-01-02");
        assert_eq!(entries[0].hours, 8.0);
        assert_eq!(entries[1].hours, 4.0);
        assert_eq!(entries[0].id, "line-1_2024-01-02");
        assert_eq!(entries[0].task_id.as_deref(), Some("100"));
        assert!(!entries[0].is_billable);
        assert_eq!(entries[0].sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn fetch_week_builds_view_from_covering_sheet() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, true).await;
        mount_units(&server, 0.125).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetLines")))
            .and(query_param("$filter", "timeSheetNo eq 'TS001'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [line("line-1", 10000, "JOB1", "100", "Submitted")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-01", "quantity": 1.0 },
                    { "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-03", "quantity": 0.25 }
                ]
            })))
            .mount(&server)
            .await;

        let view = sync.fetch_week("R1", d("2024-01-04")).await.unwrap();
        assert_eq!(view.week_start, "2024-01-01");
        assert_eq!(view.sheet.as_ref().map(|s| s.no.as_str()), Some("TS001"));
        assert_eq!(view.status, Some(TimesheetDisplayStatus::PartiallySubmitted));
        assert_eq!(view.entries.len(), 2);
        assert_eq!(view.total_hours, 10.0);
        assert_eq!(view.grid.len(), 7);
        assert_eq!(view.grid[0], DayTotal { date: "2024-01-01".into(), hours: 8.0 });
        assert_eq!(view.grid[1].hours, 0.0);
        assert_eq!(view.grid[2].hours, 2.0);
    }

    #[tokio::test]
    async fn fetch_week_without_sheet_is_empty() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;

        let view = sync.fetch_week("R1", d("2024-02-14")).await.unwrap();
        assert!(view.sheet.is_none());
        assert!(view.status.is_none());
        assert!(view.entries.is_empty());
        assert_eq!(view.grid.len(), 7);
        assert_eq!(view.total_hours, 0.0);
    }

    #[tokio::test]
    async fn push_entry_creates_line_and_detail_in_native_units() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;
        mount_units(&server, 8.0).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetLines")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [line("line-old", 10000, "JOB1", "100", "Submitted")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetLines")))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(line("line-new", 20000, "JOB1", "100", "Open")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(body_json(json!({
                "timeSheetNo": "TS001",
                "timeSheetLineNo": 20000,
                "date": "2024-01-02",
                "quantity": 0.5
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "detail-1",
                "timeSheetNo": "TS001",
                "timeSheetLineNo": 20000,
                "date": "2024-01-02",
                "quantity": 0.5
            })))
            .expect(1)
            .mount(&server)
            .await;

        let entry = TimeEntry::new("JOB1", "R1", d("2024-01-02"), 4.0, Utc::now()).task("100");
        let pushed = sync.push_entry("R1", &entry).await;
        assert_eq!(pushed.sync_status, SyncStatus::Synced);
        assert_eq!(pushed.bc_line_id.as_deref(), Some("line-new"));
    }

    #[tokio::test]
    async fn push_entry_without_sheet_marks_error() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;

        let entry = TimeEntry::new("JOB1", "R1", d("2024-03-01"), 2.0, Utc::now());
        let pushed = sync.push_entry("R1", &entry).await;
        match pushed.sync_status {
            SyncStatus::Error(message) => assert!(message.contains("2024-03-01")),
            other => panic!("expected error status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sync_pending_updates_store() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;
        mount_units(&server, 8.0).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetLines")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [line("line-1", 10000, "JOB1", "100", "Open")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "timeSheetNo": "TS001",
                "timeSheetLineNo": 10000,
                "date": "2024-01-02",
                "quantity": 0.25
            })))
            .mount(&server)
            .await;

        let data_dir = tempfile::tempdir().unwrap();
        let store_path = data_dir.path().join(DEFAULT_ENTRIES_FILE);
        let mut store = EntryStore::load(&store_path).unwrap();
        let now = Utc::now();
        let good = store
            .add(TimeEntry::new("JOB1", "R1", d("2024-01-02"), 2.0, now).task("100"))
            .unwrap();
        let orphan = store
            .add(TimeEntry::new("JOB1", "R1", d("2024-05-02"), 2.0, now).task("100"))
            .unwrap();
        let store = Mutex::new(store);

        let report = sync.sync_pending(&store, "R1").await.unwrap();
        assert_eq!(report, SyncReport { synced: 1, failed: 1 });

        let reloaded = EntryStore::load(&store_path).unwrap();
        let good = reloaded.get(&good.id).unwrap();
        assert_eq!(good.sync_status, SyncStatus::Synced);
        assert_eq!(good.bc_line_id.as_deref(), Some("line-1"));
        assert!(matches!(
            reloaded.get(&orphan.id).unwrap().sync_status,
            SyncStatus::Error(_)
        ));
    }

    fn detail_filter(line_no: i64, date: &str) -> String {
        format!(
            "timeSheetNo eq 'TS001' and timeSheetLineNo eq {} and date eq {}",
            line_no, date
        )
    }

    async fn mount_lines(server: &MockServer, lines: Vec<serde_json::Value>) {
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetLines")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": lines })))
            .mount(server)
            .await;
    }

    fn booked(entry: TimeEntry, line_id: &str, line_no: i64, date: &str, quantity: f64) -> TimeEntry {
        let mut entry = entry;
        entry.mark_synced(line_id);
        entry.booking = Some(BcBooking {
            time_sheet_no: "TS001".into(),
            line_id: line_id.into(),
            line_no,
            date: date.into(),
            quantity,
        });
        entry
    }

    #[tokio::test]
    async fn push_adds_to_hours_already_on_the_day() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;
        mount_units(&server, 1.0).await;
        mount_lines(&server, vec![line("line-1", 10000, "JOB1", "100", "Open")]).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(query_param("$filter", detail_filter(10000, "2024-01-02")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 2.0 }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(endpoint("/timeSheetDetails(d1)")))
            .and(body_json(json!({ "quantity": 5.0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 5.0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let entry = TimeEntry::new("JOB1", "R1", d("2024-01-02"), 3.0, Utc::now()).task("100");
        let pushed = sync.push_entry("R1", &entry).await;
        assert_eq!(pushed.sync_status, SyncStatus::Synced);
        assert_eq!(pushed.booking.as_ref().map(|b| b.quantity), Some(3.0));

        // Pushing the same booking again changes nothing in the ERP.
        let again = sync.push_entry("R1", &pushed).await;
        assert_eq!(again.sync_status, SyncStatus::Synced);
        assert_eq!(again.booking, pushed.booking);
    }

    #[tokio::test]
    async fn two_entries_on_one_day_are_both_booked() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;
        mount_units(&server, 1.0).await;
        mount_lines(&server, vec![line("line-1", 10000, "JOB1", "100", "Open")]).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 2.0 }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(body_json(json!({
                "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 2.0
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 2.0
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(endpoint("/timeSheetDetails(d1)")))
            .and(body_json(json!({ "quantity": 5.0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 5.0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let data_dir = tempfile::tempdir().unwrap();
        let mut store = EntryStore::load(&data_dir.path().join(DEFAULT_ENTRIES_FILE)).unwrap();
        let now = Utc::now();
        for hours in [2.0, 3.0] {
            store
                .add(TimeEntry::new("JOB1", "R1", d("2024-01-02"), hours, now).task("100"))
                .unwrap();
        }
        let store = Mutex::new(store);

        let report = sync.sync_pending(&store, "R1").await.unwrap();
        assert_eq!(report, SyncReport { synced: 2, failed: 0 });
    }

    #[tokio::test]
    async fn date_edit_moves_hours_off_the_old_day() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;
        mount_units(&server, 1.0).await;
        mount_lines(&server, vec![line("line-1", 10000, "JOB1", "100", "Open")]).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(query_param("$filter", detail_filter(10000, "2024-01-02")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 2.0 }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(query_param("$filter", detail_filter(10000, "2024-01-03")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(endpoint("/timeSheetDetails(d1)")))
            .and(body_json(json!({ "quantity": 0.0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 0.0
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(body_json(json!({
                "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-03", "quantity": 2.0
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "d2", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-03", "quantity": 2.0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let original = TimeEntry::new("JOB1", "R1", d("2024-01-02"), 2.0, Utc::now()).task("100");
        let mut edited = booked(original, "line-1", 10000, "2024-01-02", 2.0);
        edited.date = "2024-01-03".into();
        edited.mark_pending(Utc::now());

        let pushed = sync.push_entry("R1", &edited).await;
        assert_eq!(pushed.sync_status, SyncStatus::Synced);
        let booking = pushed.booking.unwrap();
        assert_eq!(booking.date, "2024-01-03");
        assert_eq!(booking.quantity, 2.0);
    }

    #[tokio::test]
    async fn job_edit_books_on_another_line_without_repointing() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, false).await;
        mount_units(&server, 1.0).await;
        mount_lines(&server, vec![line("line-1", 10000, "JOB1", "100", "Open")]).await;
        Mock::given(method("PATCH"))
            .and(path(endpoint("/timeSheetLines(line-1)")))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetLines")))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(line("line-2", 20000, "JOB2", "200", "Open")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(query_param("$filter", detail_filter(10000, "2024-01-02")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 6.0 }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(query_param("$filter", detail_filter(20000, "2024-01-02")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(endpoint("/timeSheetDetails(d1)")))
            .and(body_json(json!({ "quantity": 4.0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 4.0
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetDetails")))
            .and(body_json(json!({
                "timeSheetNo": "TS001", "timeSheetLineNo": 20000, "date": "2024-01-02", "quantity": 2.0
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "d2", "timeSheetNo": "TS001", "timeSheetLineNo": 20000, "date": "2024-01-02", "quantity": 2.0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let original = TimeEntry::new("JOB1", "R1", d("2024-01-02"), 2.0, Utc::now()).task("100");
        let mut edited = booked(original, "line-1", 10000, "2024-01-02", 2.0);
        edited.project_id = "JOB2".into();
        edited.task_id = Some("200".into());
        edited.mark_pending(Utc::now());

        let pushed = sync.push_entry("R1", &edited).await;
        assert_eq!(pushed.sync_status, SyncStatus::Synced);
        assert_eq!(pushed.bc_line_id.as_deref(), Some("line-2"));
        assert_eq!(pushed.booking.map(|b| b.line_no), Some(20000));
    }

    #[tokio::test]
    async fn failed_entry_is_retried_on_next_sync() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheets")))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_sheet(&server, false).await;
        mount_units(&server, 1.0).await;
        mount_lines(&server, vec![line("line-1", 10000, "JOB1", "100", "Open")]).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 2.0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let data_dir = tempfile::tempdir().unwrap();
        let mut store = EntryStore::load(&data_dir.path().join(DEFAULT_ENTRIES_FILE)).unwrap();
        let entry = store
            .add(TimeEntry::new("JOB1", "R1", d("2024-01-02"), 2.0, Utc::now()).task("100"))
            .unwrap();
        let store = Mutex::new(store);

        let first = sync.sync_pending(&store, "R1").await.unwrap();
        assert_eq!(first, SyncReport { synced: 0, failed: 1 });
        assert!(matches!(
            store.lock().await.get(&entry.id).unwrap().sync_status,
            SyncStatus::Error(_)
        ));

        let second = sync.sync_pending(&store, "R1").await.unwrap();
        assert_eq!(second, SyncReport { synced: 1, failed: 0 });
        assert_eq!(
            store.lock().await.get(&entry.id).unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn entry_edited_during_push_stays_pending() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheets")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "value": [{
                            "no": "TS001",
                            "resourceNo": "R1",
                            "startingDate": "2024-01-01",
                            "endingDate": "2024-01-07",
                            "openExists": true
                        }]
                    }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        mount_units(&server, 1.0).await;
        mount_lines(&server, vec![line("line-1", 10000, "JOB1", "100", "Open")]).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetDetails")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "d1", "timeSheetNo": "TS001", "timeSheetLineNo": 10000, "date": "2024-01-02", "quantity": 2.0
            })))
            .mount(&server)
            .await;

        let data_dir = tempfile::tempdir().unwrap();
        let mut store = EntryStore::load(&data_dir.path().join(DEFAULT_ENTRIES_FILE)).unwrap();
        let now = Utc::now();
        let entry = store
            .add(TimeEntry::new("JOB1", "R1", d("2024-01-02"), 2.0, now).task("100"))
            .unwrap();
        let store = Mutex::new(store);

        let (report, _) = tokio::join!(sync.sync_pending(&store, "R1"), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store
                .lock()
                .await
                .update(
                    &entry.id,
                    EntryPatch { hours: Some(3.0), ..Default::default() },
                    now + chrono::Duration::minutes(5),
                )
                .unwrap();
        });
        assert_eq!(report.unwrap(), SyncReport { synced: 1, failed: 0 });

        let guard = store.lock().await;
        let current = guard.get(&entry.id).unwrap();
        assert_eq!(current.sync_status, SyncStatus::Pending);
        assert_eq!(current.hours, 3.0);
        // What reached the ERP is remembered so the next push books only the difference.
        assert_eq!(current.booking.as_ref().map(|b| b.quantity), Some(2.0));
    }

    #[tokio::test]
    async fn submit_week_submits_only_open_lines() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_sheet(&server, true).await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetLines")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    line("line-1", 10000, "JOB1", "100", "Open"),
                    line("line-2", 20000, "JOB2", "200", "Submitted"),
                    line("line-3", 30000, "JOB3", "300", "Open")
                ]
            })))
            .mount(&server)
            .await;
        for id in ["line-1", "line-3"] {
            Mock::given(method("POST"))
                .and(path(endpoint(&format!(
                    "/timeSheetLines({})/Microsoft.NAV.submit",
                    id
                ))))
                .respond_with(ResponseTemplate::new(204))
                .expect(1)
                .mount(&server)
                .await;
        }

        let submitted = sync.submit_week("R1", d("2024-01-03")).await.unwrap();
        assert_eq!(submitted, 2);
    }

    #[tokio::test]
    async fn plan_hours_converts_to_days() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        mount_units(&server, 8.0).await;
        Mock::given(method("POST"))
            .and(path(endpoint("/jobPlanningLines")))
            .and(body_json(json!({
                "jobNo": "JOB1",
                "jobTaskNo": "100",
                "type": "Resource",
                "no": "R1",
                "quantity": 2.0,
                "planningDate": "2024-01-08"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "jobNo": "JOB1",
                "jobTaskNo": "100",
                "lineNo": 10000,
                "type": "Resource",
                "no": "R1",
                "quantity": 2.0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let planned = sync
            .plan_hours("JOB1", "100", "R1", 16.0, d("2024-01-08"))
            .await
            .unwrap();
        assert_eq!(planned.quantity, 2.0);
    }

    #[tokio::test]
    async fn decide_requires_approver() {
        let server = MockServer::start().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(&server, &cache_dir);
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheets")))
            .and(query_param("$filter", "no eq 'TS001'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{
                    "no": "TS001",
                    "resourceNo": "R1",
                    "startingDate": "2024-01-01",
                    "endingDate": "2024-01-07",
                    "approverUserId": "MGR",
                    "ownerUserId": "ALICE",
                    "submittedExists": true
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint("/timeSheetLines")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    line("line-1", 10000, "JOB1", "100", "Submitted"),
                    line("line-2", 20000, "JOB1", "100", "Approved")
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(endpoint("/timeSheetLines(line-1)/Microsoft.NAV.reject")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        assert!(matches!(
            sync.decide("ALICE", "TS001", ApprovalDecision::Approve).await,
            Err(SyncError::Forbidden(_))
        ));
        let decided = sync
            .decide("mgr", "TS001", ApprovalDecision::Reject)
            .await
            .unwrap();
        assert_eq!(decided, 1);
    }
}
