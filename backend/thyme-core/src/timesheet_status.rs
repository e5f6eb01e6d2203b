// src/timesheet_status.rs

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bc_client::BcTimeSheet;

/// The four "exists" flags Business Central reports on a timesheet header.
/// They are independent: a sheet can hold lines in several states at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimesheetFlags {
    pub open: bool,
    pub submitted: bool,
    pub rejected: bool,
    pub approved: bool,
}

impl From<&BcTimeSheet> for TimesheetFlags {
    fn from(sheet: &BcTimeSheet) -> Self {
        Self {
            open: sheet.open_exists,
            submitted: sheet.submitted_exists,
            rejected: sheet.rejected_exists,
            approved: sheet.approved_exists,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimesheetDisplayStatus {
    Open,
    Submitted,
    #[serde(rename = "Partially Submitted")]
    PartiallySubmitted,
    Rejected,
    Approved,
    Mixed,
}

impl TimesheetDisplayStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Submitted => "Submitted",
            Self::PartiallySubmitted => "Partially Submitted",
            Self::Rejected => "Rejected",
            Self::Approved => "Approved",
            Self::Mixed => "Mixed",
        }
    }

    /// Colour hint for the status badge.
    pub fn badge(self) -> &'static str {
        match self {
            Self::Open => "neutral",
            Self::Submitted => "info",
            Self::PartiallySubmitted | Self::Mixed => "warning",
            Self::Rejected => "danger",
            Self::Approved => "success",
        }
    }
}

impl fmt::Display for TimesheetDisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reduces the line-state flags to a single display status. First match wins;
/// rejection dominates everything except a purely approved sheet.
pub fn resolve(flags: TimesheetFlags) -> TimesheetDisplayStatus {
    let TimesheetFlags {
        open,
        submitted,
        rejected,
        approved,
    } = flags;

    if approved && !open && !submitted && !rejected {
        TimesheetDisplayStatus::Approved
    } else if rejected {
        TimesheetDisplayStatus::Rejected
    } else if submitted && !open {
        TimesheetDisplayStatus::Submitted
    } else if submitted && open {
        TimesheetDisplayStatus::PartiallySubmitted
    } else if approved && (open || submitted) {
        TimesheetDisplayStatus::Mixed
    } else {
        TimesheetDisplayStatus::Open
    }
}

pub fn resolve_sheet(sheet: &BcTimeSheet) -> TimesheetDisplayStatus {
    resolve(TimesheetFlags::from(sheet))
}
