// src/lib.rs

pub mod approvals;
pub mod bc_client;
pub mod config;
pub mod entry_store;
pub mod pricing;
pub mod reporting;
pub mod server;
pub mod sync;
pub mod time_entries;
pub mod timer;
pub mod timesheet_status;
pub mod uom;
