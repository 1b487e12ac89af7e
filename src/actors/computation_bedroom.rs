//! `ComputationBedroom` (`spec.md` §4.7): withholds tile computation until
//! some query depending on that tile has output-queue headroom. The central
//! backpressure mechanism for the compute path.

use std::collections::HashMap;

use crate::bus::Msg;
use crate::types::{Fingerprint, QueryId, RasterId, TileId};

struct PendingTile {
	fingerprint: Fingerprint,
	interested: Vec<QueryId>,
}

/// Per-raster bedroom for tile computation requests.
#[derive(Default)]
pub struct ComputationBedroom {
	raster: RasterId,
	/// Tiles waiting for permission to compute.
	pending: HashMap<TileId, PendingTile>,
	/// Current known headroom per query, updated by `output_queue_update`.
	headroom: HashMap<QueryId, usize>,
}

impl ComputationBedroom {
	#[must_use]
	pub fn new(raster: RasterId) -> Self {
		Self {
			raster,
			pending: HashMap::new(),
			headroom: HashMap::new(),
		}
	}

	/// `schedule_compute_when_needed(tile)`: register a tile as waiting,
	/// tagged with the queries currently subscribed to it. If any of those
	/// queries already has headroom, release immediately.
	pub fn schedule_compute_when_needed(&mut self, tile: TileId, fingerprint: Fingerprint, queries: Vec<QueryId>) -> Vec<Msg> {
		if queries.iter().any(|q| self.headroom.get(q).copied().unwrap_or(0) > 0) {
			return vec![Msg::ScheduleCompute { raster: self.raster, tile, fingerprint }];
		}
		self.pending.insert(tile, PendingTile { fingerprint, interested: queries });
		Vec::new()
	}

	/// `output_queue_update(query, headroom)`: release every pending tile
	/// that has this query among its interested set, now that it has
	/// headroom.
	pub fn output_queue_update(&mut self, query: QueryId, headroom: usize) -> Vec<Msg> {
		self.headroom.insert(query, headroom);
		if headroom == 0 {
			return Vec::new();
		}
		let mut released = Vec::new();
		self.pending.retain(|tile, pending| {
			if pending.interested.contains(&query) {
				released.push(Msg::ScheduleCompute {
					raster: self.raster,
					tile: *tile,
					fingerprint: pending.fingerprint,
				});
				false
			} else {
				true
			}
		});
		released
	}

	/// Drop all bookkeeping for a killed query: remove it from interest
	/// lists, and drop any tile whose only interested query was this one
	/// (its compute request is simply forgotten — the caller, `Computer`,
	/// is responsible for cancelling any in-flight pool task separately).
	pub fn kill_query(&mut self, query: QueryId) {
		self.headroom.remove(&query);
		self.pending.retain(|_, pending| {
			pending.interested.retain(|q| *q != query);
			!pending.interested.is_empty()
		});
	}

	#[must_use]
	pub fn is_pending(&self, tile: TileId) -> bool {
		self.pending.contains_key(&tile)
	}
}
