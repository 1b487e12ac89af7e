//! `BuilderBedroom` (`spec.md` §4.9): withholds production-array builds
//! until the owning query reports output-queue headroom. Same design as
//! [`super::computation_bedroom::ComputationBedroom`], specialized to a
//! single owning query per array rather than a many-queries-per-tile set.

use std::collections::{HashMap, HashSet};

use crate::bus::Msg;
use crate::types::{ArrayId, QueryId, RasterId};

#[derive(Default)]
pub struct BuilderBedroom {
	raster: RasterId,
	pending: HashMap<QueryId, HashSet<ArrayId>>,
	headroom: HashMap<QueryId, usize>,
}

impl BuilderBedroom {
	#[must_use]
	pub fn new(raster: RasterId) -> Self {
		Self {
			raster,
			pending: HashMap::new(),
			headroom: HashMap::new(),
		}
	}

	/// `build_when_ready(array)`: hold until the owning query has headroom.
	pub fn build_when_ready(&mut self, query: QueryId, array: ArrayId) -> Vec<Msg> {
		if self.headroom.get(&query).copied().unwrap_or(0) > 0 {
			self.consume_one_headroom(query);
			return vec![Msg::BuildNow { raster: self.raster, array }];
		}
		self.pending.entry(query).or_default().insert(array);
		Vec::new()
	}

	/// `output_queue_update(query, headroom)`: release up to `headroom`
	/// pending arrays for this query, guaranteeing the in-flight count for a
	/// query never exceeds its headroom at release time (`spec.md` §4.9).
	pub fn output_queue_update(&mut self, query: QueryId, headroom: usize) -> Vec<Msg> {
		self.headroom.insert(query, headroom);
		let mut released = Vec::new();
		if let Some(set) = self.pending.get_mut(&query) {
			while released.len() < headroom {
				let Some(&array) = set.iter().next() else { break };
				set.remove(&array);
				released.push(Msg::BuildNow { raster: self.raster, array });
			}
			if set.is_empty() {
				self.pending.remove(&query);
			}
		}
		let consumed = released.len();
		if let Some(h) = self.headroom.get_mut(&query) {
			*h = h.saturating_sub(consumed);
		}
		released
	}

	fn consume_one_headroom(&mut self, query: QueryId) {
		if let Some(h) = self.headroom.get_mut(&query) {
			*h = h.saturating_sub(1);
		}
	}

	pub fn kill_query(&mut self, query: QueryId) {
		self.headroom.remove(&query);
		self.pending.remove(&query);
	}

	#[must_use]
	pub fn is_pending(&self, query: QueryId, array: ArrayId) -> bool {
		self.pending.get(&query).is_some_and(|s| s.contains(&array))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn arr(q: u64, i: usize) -> ArrayId {
		ArrayId::new(QueryId(q), i)
	}

	#[test]
	fn releases_immediately_with_headroom() {
		let mut b = BuilderBedroom::new(RasterId(0));
		b.output_queue_update(QueryId(1), 2);
		let msgs = b.build_when_ready(QueryId(1), arr(1, 0));
		assert_eq!(msgs.len(), 1);
	}

	#[test]
	fn withholds_without_headroom_then_releases() {
		let mut b = BuilderBedroom::new(RasterId(0));
		let msgs = b.build_when_ready(QueryId(1), arr(1, 0));
		assert!(msgs.is_empty());
		assert!(b.is_pending(QueryId(1), arr(1, 0)));

		let msgs = b.output_queue_update(QueryId(1), 1);
		assert_eq!(msgs.len(), 1);
		assert!(!b.is_pending(QueryId(1), arr(1, 0)));
	}

	#[test]
	fn never_releases_more_than_headroom() {
		let mut b = BuilderBedroom::new(RasterId(0));
		b.build_when_ready(QueryId(1), arr(1, 0));
		b.build_when_ready(QueryId(1), arr(1, 1));
		b.build_when_ready(QueryId(1), arr(1, 2));
		let msgs = b.output_queue_update(QueryId(1), 2);
		assert_eq!(msgs.len(), 2);
		assert!(b.pending.get(&QueryId(1)).unwrap().len() == 1);
	}
}
