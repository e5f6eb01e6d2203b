// src/approvals.rs

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::bc_client::{BcTimeSheet, LineAction};
use crate::timesheet_status::{resolve_sheet, TimesheetDisplayStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    pub fn line_action(self) -> LineAction {
        match self {
            Self::Approve => LineAction::Approve,
            Self::Reject => LineAction::Reject,
        }
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown approval decision '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalItem {
    pub sheet: BcTimeSheet,
    pub status: TimesheetDisplayStatus,
}

/// A user may decide a sheet when they are its approver, it is not their own
/// sheet, and something on it awaits a decision.
pub fn can_approve(user_id: &str, sheet: &BcTimeSheet) -> bool {
    let is_approver = sheet
        .approver_user_id
        .as_deref()
        .is_some_and(|approver| approver.eq_ignore_ascii_case(user_id));
    let is_owner = sheet
        .owner_user_id
        .as_deref()
        .is_some_and(|owner| owner.eq_ignore_ascii_case(user_id));
    is_approver && !is_owner && sheet.submitted_exists
}

/// Filters `sheets` down to those `user_id` can decide, oldest period first.
pub fn approvable(user_id: &str, sheets: Vec<BcTimeSheet>) -> Vec<ApprovalItem> {
    let mut items: Vec<ApprovalItem> = sheets
        .into_iter()
        .filter(|sheet| can_approve(user_id, sheet))
        .map(|sheet| ApprovalItem {
            status: resolve_sheet(&sheet),
            sheet,
        })
        .collect();
    items.sort_by(|a, b| a.sheet.starting_date.cmp(&b.sheet.starting_date));
    items
}
