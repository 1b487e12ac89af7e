//! Scheduler-wide counters (`SPEC_FULL.md` §10), grounded on the teacher's
//! progress-bar counters in `versatiles_container/src/progress/*` that track
//! "items processed" counts during batch conversion. Purely observational:
//! nothing here feeds back into scheduling decisions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, lock-free counters. One instance per [`crate::scheduler::Scheduler`],
/// cloned (as an `Arc`) into every actor that can observe a countable event.
#[derive(Default)]
pub struct Metrics {
	pub tiles_computed: AtomicU64,
	pub cache_hits: AtomicU64,
	pub cache_misses: AtomicU64,
	pub bytes_written: AtomicU64,
}

impl Metrics {
	#[must_use]
	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			tiles_computed: self.tiles_computed.load(Ordering::Relaxed),
			cache_hits: self.cache_hits.load(Ordering::Relaxed),
			cache_misses: self.cache_misses.load(Ordering::Relaxed),
			bytes_written: self.bytes_written.load(Ordering::Relaxed),
		}
	}

	pub fn record_cache_hit(&self) {
		self.cache_hits.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_cache_miss(&self) {
		self.cache_misses.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_tile_computed(&self) {
		self.tiles_computed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_bytes_written(&self, n: u64) {
		self.bytes_written.fetch_add(n, Ordering::Relaxed);
	}
}

/// Point-in-time copy of [`Metrics`], returned by [`crate::scheduler::Scheduler::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
	pub tiles_computed: u64,
	pub cache_hits: u64,
	pub cache_misses: u64,
	pub bytes_written: u64,
}
