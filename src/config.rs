//! Scheduler-wide configuration: worker-pool sizing, retry policy, and cache
//! validation behavior. Grounded on `versatiles_core/src/concurrency.rs`
//! (`ConcurrencyLimits`) and `versatiles_core/src/config/mod.rs`.

/// Tunable knobs for one [`crate::scheduler::Scheduler`] instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// Threads dedicated to I/O-bound work: file hashing, cache reads,
	/// cache writes. Defaults to `3x` CPU count, matching
	/// `ConcurrencyLimits::default().io_bound`.
	pub io_pool_size: usize,
	/// Threads dedicated to CPU-bound work: user compute functions,
	/// merging, resampling. Defaults to `1x` CPU count.
	pub compute_pool_size: usize,
	/// Default output queue capacity `Q` used when a query doesn't specify
	/// one explicitly.
	pub default_queue_capacity: usize,
	/// How many times a transient `IoError` (read/write/hash) is retried
	/// before being surfaced to dependent queries (`spec.md` §7, §9(b);
	/// resolved in `SPEC_FULL.md` §10).
	pub io_retry_cap: u32,
	/// Whether reads re-verify the on-disk checksum against `H` (`spec.md`
	/// §6: "optional on-read checksum verification"). Disabling this still
	/// trusts the file-name fingerprint but skips re-hashing file bytes on
	/// every read, trading safety for throughput on trusted filesystems.
	pub verify_checksum_on_read: bool,
}

impl SchedulerConfig {
	/// CPU-scaled defaults, mirroring `ConcurrencyLimits::default()`.
	#[must_use]
	pub fn with_defaults() -> Self {
		let cpus = num_cpus::get();
		Self {
			io_pool_size: (cpus * 3).max(1),
			compute_pool_size: cpus.max(1),
			default_queue_capacity: 8,
			io_retry_cap: 3,
			verify_checksum_on_read: true,
		}
	}
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self::with_defaults()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_scale_with_cpu_count() {
		let cfg = SchedulerConfig::with_defaults();
		let cpus = num_cpus::get();
		assert_eq!(cfg.io_pool_size, cpus * 3);
		assert_eq!(cfg.compute_pool_size, cpus);
		assert!(cfg.io_retry_cap > 0);
	}
}
