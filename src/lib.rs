//! Attendance analytics: role-scoped, time-bucketed views over raw
//! attendance marks, a selection controller that discards stale
//! recomputes, and roster report export.

pub mod aggregate;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod exporter;
pub mod models;
pub mod report;
pub mod retry;
pub mod scope;
pub mod store;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::{AnalyticsError, AnalyticsResult};
