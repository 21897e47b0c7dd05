//! obspine: point-in-time estimate/actual reconciliation.
//!
//! Observations of financial metrics (consensus estimates and reported
//! actuals) are stored append-only with knowledge timestamps, then compared
//! with strict as-of semantics: what was knowable at a given instant, never
//! what arrived later.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod registry;
pub mod store;
