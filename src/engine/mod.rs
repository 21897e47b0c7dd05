//! Estimate/actual reconciliation engine.
//!
//! All engine state is read-only store access or pure computation; instances
//! are cheap to clone and safe to use concurrently across periods/entities.

pub mod authority;
pub mod compare;
pub mod derive;
pub mod lineage;
pub mod reconcile;
pub mod temporal;
pub mod watcher;

pub use authority::AuthorityResolver;
pub use compare::{BatchCursor, BatchRequest, CompareRequest, ComparisonEngine, ResolveSpec};
pub use derive::DerivedGenerator;
pub use lineage::{Lineage, LineageHop, LineageTracker};
pub use reconcile::{ConsensusSpread, SourceComparison, SourceReconciler};
pub use temporal::{AsOfPolicy, TemporalResolver};
pub use watcher::{TransitionWatcher, WatcherConfig};
