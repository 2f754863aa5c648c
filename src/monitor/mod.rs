//! MONITOR subsystem: global answer accounting for termination detection.
//!
//! Stages report every answer they create or consume, every dataflow edge they
//! join, and every source that runs dry. The monitor is the only place this
//! information comes together, which is what lets it decide that a root of a
//! cyclic network will never see another answer.

/// Monitor worker and its handle.
pub mod dispatcher;
/// Answer ledger and termination rule.
pub mod ledger;

pub use dispatcher::{Monitor, MonitorHandle, RootCallback, RootSignal};
pub use ledger::{AnswerCount, LedgerSnapshot};
