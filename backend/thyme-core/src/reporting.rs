// src/reporting.rs

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::bc_client::{BcJob, BcJobPlanningLine, BcResource};
use crate::time_entries::{calculate_total_hours, entries_in_range, round_hours, TimeEntry, DATE_FORMAT};
use crate::uom::{convert_to_hours, get_hours_per_day, ResourceUnitOfMeasure, UomConversionMap};

const RESOURCE_LINE_TYPE: &str = "Resource";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilizationRow {
    pub resource_no: String,
    pub name: String,
    pub logged_hours: f64,
    pub billable_hours: f64,
    pub capacity_hours: f64,
    pub utilization_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskActual {
    pub job_task_no: String,
    pub planned_hours: f64,
    pub actual_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub job_no: String,
    pub description: String,
    pub planned_hours: f64,
    pub actual_hours: f64,
    pub remaining_hours: f64,
    pub billable_hours: f64,
    pub tasks: Vec<TaskActual>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillableSplit {
    pub billable: f64,
    pub non_billable: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoursReport {
    pub from: String,
    pub to: String,
    pub total_hours: f64,
    pub by_project: BTreeMap<String, f64>,
    pub billable: BillableSplit,
}

/// Monday to Friday days in `from..=to`.
pub fn working_days(from: NaiveDate, to: NaiveDate) -> u32 {
    let mut count = 0;
    let mut day = from;
    while day <= to {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            count += 1;
        }
        day += Duration::days(1);
    }
    count
}

pub fn team_utilization(
    resources: &[BcResource],
    entries_by_resource: &HashMap<String, Vec<TimeEntry>>,
    records: &[ResourceUnitOfMeasure],
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<UtilizationRow> {
    let days = working_days(from, to) as f64;
    resources
        .iter()
        .map(|resource| {
            let entries = entries_by_resource
                .get(&resource.no)
                .map(|all| entries_in_range(all, from, to))
                .unwrap_or_default();
            let logged = calculate_total_hours(&entries);
            let split = billable_split(&entries);
            let capacity = days * get_hours_per_day(records, Some(&resource.no));
            let utilization = if capacity > 0.0 {
                logged / capacity * 100.0
            } else {
                0.0
            };
            UtilizationRow {
                resource_no: resource.no.clone(),
                name: resource.name.clone(),
                logged_hours: round_hours(logged),
                billable_hours: round_hours(split.billable),
                capacity_hours: round_hours(capacity),
                utilization_pct: round_hours(utilization),
            }
        })
        .collect()
}

fn task_row<'a>(tasks: &'a mut BTreeMap<String, TaskActual>, job_task_no: &str) -> &'a mut TaskActual {
    tasks
        .entry(job_task_no.to_string())
        .or_insert_with(|| TaskActual {
            job_task_no: job_task_no.to_string(),
            planned_hours: 0.0,
            actual_hours: 0.0,
        })
}

pub fn project_summary(
    job: &BcJob,
    planning_lines: &[BcJobPlanningLine],
    map: &UomConversionMap,
    entries: &[TimeEntry],
) -> ProjectSummary {
    let mut tasks: BTreeMap<String, TaskActual> = BTreeMap::new();

    let mut planned = 0.0;
    for line in planning_lines
        .iter()
        .filter(|l| l.job_no == job.no && l.line_type == RESOURCE_LINE_TYPE)
    {
        let hours = convert_to_hours(&line.no, line.quantity, map);
        planned += hours;
        task_row(&mut tasks, &line.job_task_no).planned_hours += hours;
    }

    let job_entries: Vec<TimeEntry> = entries
        .iter()
        .filter(|e| e.project_id == job.no)
        .cloned()
        .collect();
    for entry in &job_entries {
        let task_no = entry.task_id.as_deref().unwrap_or_default();
        task_row(&mut tasks, task_no).actual_hours += entry.hours;
    }
    let actual = calculate_total_hours(&job_entries);

    ProjectSummary {
        job_no: job.no.clone(),
        description: job.description.clone(),
        planned_hours: round_hours(planned),
        actual_hours: round_hours(actual),
        remaining_hours: round_hours((planned - actual).max(0.0)),
        billable_hours: round_hours(billable_split(&job_entries).billable),
        tasks: tasks
            .into_values()
            .map(|mut t| {
                t.planned_hours = round_hours(t.planned_hours);
                t.actual_hours = round_hours(t.actual_hours);
                t
            })
            .collect(),
    }
}

pub fn hours_by_project(entries: &[TimeEntry]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for entry in entries {
        *totals.entry(entry.project_id.clone()).or_insert(0.0) += entry.hours;
    }
    totals
}

pub fn billable_split(entries: &[TimeEntry]) -> BillableSplit {
    entries.iter().fold(BillableSplit::default(), |mut split, e| {
        if e.is_billable {
            split.billable += e.hours;
        } else {
            split.non_billable += e.hours;
        }
        split
    })
}

pub fn hours_report(entries: &[TimeEntry], from: NaiveDate, to: NaiveDate) -> HoursReport {
    let in_range = entries_in_range(entries, from, to);
    HoursReport {
        from: from.format(DATE_FORMAT).to_string(),
        to: to.format(DATE_FORMAT).to_string(),
        total_hours: round_hours(calculate_total_hours(&in_range)),
        by_project: hours_by_project(&in_range)
            .into_iter()
            .map(|(project, hours)| (project, round_hours(hours)))
            .collect(),
        billable: billable_split(&in_range),
    }
}
