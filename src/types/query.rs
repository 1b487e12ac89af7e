//! Query registration and mutable per-query bookkeeping (`spec.md` §3, §4.12).

use std::collections::HashSet;

use super::footprint::{ChannelSet, Footprint, OrderingPolicy};
use super::ids::{QueryId, RasterId, TileId};

/// Immutable-after-creation query parameters (`spec.md` §3, §6).
#[derive(Debug, Clone)]
pub struct QuerySpec {
	pub raster: RasterId,
	pub footprint: Footprint,
	pub channels: ChannelSet,
	pub ordering: OrderingPolicy,
	/// `Q`: the bounded output queue's fixed capacity.
	pub queue_capacity: usize,
}

/// Lifecycle of one posted query (`spec.md` §4.12).
///
/// ```text
/// posted -> planned -> draining -> done
///    |         |           |
///    +------ kill ---------+ (-> cancelling -> gone)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLifecycle {
	Posted,
	Planned,
	Draining,
	Done,
	Cancelling,
	Gone,
}

/// Mutable state [`crate::actors::queries_handler::QueriesHandler`] tracks per
/// query: which production arrays exist, how many have been produced vs.
/// delivered, and the cancellation flag (`spec.md` §3).
#[derive(Debug)]
pub struct QueryState {
	pub id: QueryId,
	pub spec: QuerySpec,
	pub lifecycle: QueryLifecycle,
	/// Total number of production arrays this query decomposes into, in
	/// delivery order.
	pub array_count: usize,
	/// Indices (into `0..array_count`) that have completed `Builder::built`
	/// but have not yet been pushed to the output queue, because an earlier
	/// array in delivery order is still pending (`spec.md` §4.2 step 3).
	pub ready_not_delivered: HashSet<usize>,
	/// Number of arrays delivered so far; delivery is always a prefix of the
	/// ordering (`spec.md` §8 property 3), so this doubles as "next index to
	/// deliver".
	pub delivered_count: usize,
	/// Arrays currently in flight (Producer has been asked to build them but
	/// they have not yet reached `ready_not_delivered` or been delivered).
	pub in_flight_count: usize,
	pub cancelled: bool,
}

impl QueryState {
	#[must_use]
	pub fn new(id: QueryId, spec: QuerySpec, array_count: usize) -> Self {
		Self {
			id,
			spec,
			lifecycle: QueryLifecycle::Posted,
			array_count,
			ready_not_delivered: HashSet::new(),
			delivered_count: 0,
			in_flight_count: 0,
			cancelled: false,
		}
	}

	/// Headroom per `spec.md` §4.2 step 2: `Q - produced_and_undelivered -
	/// already_in_flight`.
	#[must_use]
	pub fn allowed_concurrency(&self) -> usize {
		let used = self.ready_not_delivered.len() + self.in_flight_count;
		self.spec.queue_capacity.saturating_sub(used)
	}

	#[must_use]
	pub fn is_complete(&self) -> bool {
		self.delivered_count >= self.array_count
	}

	/// Mark array `idx` ready (decrements in-flight, adds it to the
	/// ready-but-undelivered set). Does not advance `delivered_count` —
	/// delivery is only confirmed by calling [`Self::confirm_delivered`] once
	/// the array has actually been handed to the consumer. Advancing on mere
	/// readiness would let `allowed_concurrency()` open up headroom for work
	/// nobody has received yet if the send to the consumer doesn't go through
	/// (`spec.md` §8 property 2: `|in-flight| + |undelivered ready| <= Q`).
	pub fn mark_ready(&mut self, idx: usize) {
		self.in_flight_count = self.in_flight_count.saturating_sub(1);
		self.ready_not_delivered.insert(idx);
	}

	/// Whether the next array in delivery order (`delivered_count`) is ready
	/// to be sent to the consumer.
	#[must_use]
	pub fn next_deliverable(&self) -> bool {
		self.ready_not_delivered.contains(&self.delivered_count)
	}

	/// Confirm that the next array in delivery order was actually delivered.
	/// Call only after a successful send; see [`Self::mark_ready`].
	pub fn confirm_delivered(&mut self) {
		self.ready_not_delivered.remove(&self.delivered_count);
		self.delivered_count += 1;
	}
}

/// The set of cache tiles a production array depends on, computed once at
/// plan time (`spec.md` §4.3).
#[derive(Debug, Clone)]
pub struct ArrayPlan {
	pub footprint: Footprint,
	pub tiles: Vec<TileId>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::footprint::Footprint;

	fn spec(cap: usize) -> QuerySpec {
		QuerySpec {
			raster: RasterId(0),
			footprint: Footprint::new((0.0, 0.0), (1.0, 1.0), 0.0, 10, 10),
			channels: ChannelSet::new(vec![]),
			ordering: OrderingPolicy::RowMajor,
			queue_capacity: cap,
		}
	}

	#[test]
	fn headroom_shrinks_with_in_flight_and_undelivered() {
		let mut q = QueryState::new(QueryId(0), spec(2), 10);
		assert_eq!(q.allowed_concurrency(), 2);
		q.in_flight_count = 1;
		assert_eq!(q.allowed_concurrency(), 1);
		q.mark_ready(0); // in_flight -1, array 0 now ready-but-undelivered
		assert_eq!(q.delivered_count, 0);
		assert_eq!(q.allowed_concurrency(), 1); // still counted until confirmed
		q.confirm_delivered();
		assert_eq!(q.delivered_count, 1);
		assert_eq!(q.allowed_concurrency(), 2);
	}

	#[test]
	fn mark_ready_respects_delivery_prefix() {
		let mut q = QueryState::new(QueryId(0), spec(4), 3);
		q.in_flight_count = 3;
		// array 1 finishes before array 0: nothing deliverable yet
		q.mark_ready(1);
		assert!(!q.next_deliverable());
		assert_eq!(q.delivered_count, 0);
		// array 0 finishes: it becomes deliverable, then 1 after confirming 0
		q.mark_ready(0);
		assert!(q.next_deliverable());
		q.confirm_delivered();
		assert_eq!(q.delivered_count, 1);
		assert!(q.next_deliverable());
		q.confirm_delivered();
		assert_eq!(q.delivered_count, 2);
	}

	#[test]
	fn completion_detected() {
		let mut q = QueryState::new(QueryId(0), spec(1), 1);
		assert!(!q.is_complete());
		q.in_flight_count = 1;
		q.mark_ready(0);
		q.confirm_delivered();
		assert!(q.is_complete());
	}

	#[test]
	fn readiness_does_not_advance_delivery_until_confirmed() {
		// Guards against the bug where a slow/closed consumer's failed send
		// could silently let the scheduler believe the slot was delivered.
		let mut q = QueryState::new(QueryId(0), spec(2), 2);
		q.in_flight_count = 2;
		q.mark_ready(0);
		q.mark_ready(1);
		assert_eq!(q.delivered_count, 0);
		assert_eq!(q.allowed_concurrency(), 0); // both still pending delivery
		assert!(!q.is_complete());
	}
}
