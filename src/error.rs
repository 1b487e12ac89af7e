//! Error kinds surfaced to queries, per `spec.md` §7.
//!
//! The teacher (`versatiles_container`, `versatiles_core`) uses plain
//! `anyhow::Result` everywhere and does not reach for `thiserror`; this crate
//! follows suit. `SchedulerError` exists only to give query-facing failures a
//! stable `match`-able shape, and is always carried inside an `anyhow::Error`
//! via `.context(...)`, the way the teacher attaches context in e.g.
//! `versatiles_container/src/cache/cache_on_disk.rs`.

use std::fmt;

/// Terminal error kinds a query can observe via [`crate::handle::QueryHandle::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
	/// The query was cancelled by its own caller. Not an error for the
	/// library; surfaced so the consumer can distinguish "cancelled" from
	/// "end of stream" if it cares to.
	UserCancelled,
	/// The user compute function failed. The owning tile returns to ABSENT.
	ComputeError(String),
	/// A read, write or hash operation failed after exhausting the retry cap.
	IoError(String),
	/// Checksum mismatch on validate; the tile was deleted and will be
	/// recomputed on next demand.
	CorruptCache { tile: String },
	/// Invalid query parameters, surfaced synchronously at `post_query` time.
	ConfigError(String),
}

impl fmt::Display for SchedulerError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SchedulerError::UserCancelled => write!(f, "query cancelled by caller"),
			SchedulerError::ComputeError(msg) => write!(f, "compute function failed: {msg}"),
			SchedulerError::IoError(msg) => write!(f, "I/O error: {msg}"),
			SchedulerError::CorruptCache { tile } => write!(f, "cache tile {tile} failed checksum validation"),
			SchedulerError::ConfigError(msg) => write!(f, "invalid query configuration: {msg}"),
		}
	}
}

impl std::error::Error for SchedulerError {}

/// Assert a scheduler-thread invariant. Violating one is a scheduler bug, not
/// a recoverable error (`spec.md` §4.13: "Scheduler-thread invariants are
/// assertions; violation aborts the process").
#[macro_export]
macro_rules! invariant {
	($cond:expr, $($arg:tt)+) => {
		if !$cond {
			panic!("internal invariant violated: {}", format!($($arg)+));
		}
	};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_messages_are_human_readable() {
		assert_eq!(SchedulerError::UserCancelled.to_string(), "query cancelled by caller");
		assert!(SchedulerError::CorruptCache { tile: "t1".into() }.to_string().contains("t1"));
	}

	#[test]
	#[should_panic(expected = "internal invariant violated")]
	fn invariant_macro_panics_on_false() {
		invariant!(1 + 1 == 3, "arithmetic broke: {}", 4);
	}

	#[test]
	fn invariant_macro_is_silent_on_true() {
		invariant!(1 + 1 == 2, "fine");
	}
}
