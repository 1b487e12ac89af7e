//! `ComputeAccumulator` (`spec.md` §4.8): gathers partial compute outputs
//! for a tile until complete, then emits `merge(tile, partials)`.

use std::collections::HashMap;

use crate::bus::{Msg, PartialMsg};
use crate::events::EventBus;
use crate::types::{Fingerprint, RasterId, TileId, TileState};

struct Accumulating {
	fingerprint: Fingerprint,
	partials: Vec<PartialMsg>,
	total: usize,
}

pub struct ComputeAccumulator {
	raster: RasterId,
	events: EventBus,
	in_progress: HashMap<TileId, Accumulating>,
}

impl ComputeAccumulator {
	#[must_use]
	pub fn new(raster: RasterId, events: EventBus) -> Self {
		Self {
			raster,
			events,
			in_progress: HashMap::new(),
		}
	}

	pub fn computed_partial(&mut self, tile: TileId, fingerprint: Fingerprint, partial: PartialMsg, total: usize) -> Vec<Msg> {
		let entry = self.in_progress.entry(tile).or_insert_with(|| Accumulating {
			fingerprint,
			partials: Vec::new(),
			total,
		});
		entry.partials.push(partial);
		if entry.partials.len() >= entry.total {
			let Accumulating { fingerprint, partials, .. } = self.in_progress.remove(&tile).expect("just inserted");
			// Merging isn't a `TileState` this crate's cache state machine
			// tracks internally (only `CacheHandler` mutates `TileRecord`,
			// and no actor here reports back to it mid-merge); the event is
			// purely an external progress signal at the point all of a
			// tile's partials have arrived and merging is about to start.
			self.events.tile_state_changed(tile, TileState::Merging);
			return vec![Msg::MergeTile {
				raster: self.raster,
				tile,
				fingerprint,
				partials,
			}];
		}
		Vec::new()
	}

	/// Drop partial state for a tile whose compute was cancelled (all
	/// subscribers gone).
	pub fn cancel_tile(&mut self, tile: TileId) {
		self.in_progress.remove(&tile);
	}
}
