//! `Producer` (`spec.md` §4.3): turns a batch of production-array requests
//! into cache reads and a build, per array. Holds the only per-array
//! bookkeeping that correlates "all dependent tiles readable" with "builder
//! bedroom says go" — both must hold before `Build` is emitted.

use std::collections::HashMap;

use crate::bus::Msg;
use crate::types::{ArrayId, ArrayPlan, Fingerprint, Footprint, QueryId, RasterId, TileId};

struct Tracking {
	plan: ArrayPlan,
	ready: HashMap<TileId, Fingerprint>,
	build_now: bool,
}

impl Tracking {
	fn all_tiles_ready(&self) -> bool {
		self.plan.tiles.iter().all(|t| self.ready.contains_key(t))
	}
}

pub struct Producer {
	raster: RasterId,
	native_footprint: Footprint,
	in_flight: HashMap<ArrayId, Tracking>,
}

impl Producer {
	#[must_use]
	pub fn new(raster: RasterId, native_footprint: Footprint) -> Self {
		Self {
			raster,
			native_footprint,
			in_flight: HashMap::new(),
		}
	}

	/// `make_arrays(query, arrays)`: kick off cache reads and bedroom
	/// registration for each requested array.
	pub fn handle_make_arrays(&mut self, query: QueryId, arrays: Vec<(ArrayId, ArrayPlan)>) -> Vec<Msg> {
		let mut out = Vec::new();
		for (array, plan) in arrays {
			out.push(Msg::MayIRead {
				raster: self.raster,
				query,
				array,
				tiles: plan.tiles.clone(),
			});
			out.push(Msg::BuildWhenReady { raster: self.raster, array });
			self.in_flight.insert(
				array,
				Tracking {
					plan,
					ready: HashMap::new(),
					build_now: false,
				},
			);
		}
		out
	}

	/// `you_may_read(array, ready_tiles)` from `CacheHandler`.
	pub fn handle_you_may_read(&mut self, array: ArrayId, ready_tiles: Vec<(TileId, Fingerprint)>) -> Vec<Msg> {
		let Some(tracking) = self.in_flight.get_mut(&array) else { return Vec::new() };
		tracking.ready.extend(ready_tiles);
		self.try_build(array)
	}

	/// `build(array)` from `BuilderBedroom`: the query now has output headroom.
	pub fn handle_build_now(&mut self, array: ArrayId) -> Vec<Msg> {
		let Some(tracking) = self.in_flight.get_mut(&array) else { return Vec::new() };
		tracking.build_now = true;
		self.try_build(array)
	}

	fn try_build(&mut self, array: ArrayId) -> Vec<Msg> {
		let Some(tracking) = self.in_flight.get(&array) else { return Vec::new() };
		if !tracking.build_now || !tracking.all_tiles_ready() {
			return Vec::new();
		}
		let tracking = self.in_flight.remove(&array).expect("checked above");
		let tiles: Vec<(TileId, Fingerprint)> = tracking.plan.tiles.iter().map(|t| (*t, tracking.ready[t])).collect();
		let needs_resample = !tracking.plan.footprint.is_aligned_with(&self.native_footprint);
		vec![Msg::Build {
			raster: self.raster,
			array,
			tiles,
			needs_resample,
		}]
	}

	/// `built(array, data)` from `Builder`: forward to `QueriesHandler`.
	pub fn handle_built(&mut self, query: QueryId, array: ArrayId, data: std::sync::Arc<[u8]>) -> Vec<Msg> {
		vec![Msg::MadeArray { raster: self.raster, query, array, data }]
	}

	pub fn handle_build_failed(&mut self, query: QueryId, array: ArrayId, error: String) -> Vec<Msg> {
		self.in_flight.remove(&array);
		vec![Msg::ArrayFailed { raster: self.raster, query, array, error }]
	}

	pub fn handle_tile_failed(&mut self, query: QueryId, array: ArrayId, error: String) -> Vec<Msg> {
		self.handle_build_failed(query, array, error)
	}

	pub fn kill_query(&mut self, query: QueryId) {
		self.in_flight.retain(|array, _| array.query != query);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::TileIndex;

	fn native() -> Footprint {
		Footprint::new((0.0, 0.0), (1.0, 1.0), 0.0, 256, 256)
	}

	fn plan(tiles: Vec<TileId>) -> ArrayPlan {
		ArrayPlan { footprint: native(), tiles }
	}

	fn tile(x: u64) -> TileId {
		TileId::new(RasterId(0), TileIndex::new(0, x, 0))
	}

	#[test]
	fn build_waits_for_both_readiness_and_headroom() {
		let mut p = Producer::new(RasterId(0), native());
		let array = ArrayId::new(QueryId(1), 0);
		p.handle_make_arrays(QueryId(1), vec![(array, plan(vec![tile(0)]))]);

		let msgs = p.handle_you_may_read(array, vec![(tile(0), Fingerprint([0u8; 32]))]);
		assert!(msgs.is_empty(), "readiness alone shouldn't build without headroom");

		let msgs = p.handle_build_now(array);
		assert_eq!(msgs.len(), 1);
		assert!(matches!(msgs[0], Msg::Build { .. }));
	}

	#[test]
	fn build_waits_for_all_tiles_when_headroom_arrives_first() {
		let mut p = Producer::new(RasterId(0), native());
		let array = ArrayId::new(QueryId(1), 0);
		p.handle_make_arrays(QueryId(1), vec![(array, plan(vec![tile(0), tile(1)]))]);

		let msgs = p.handle_build_now(array);
		assert!(msgs.is_empty());

		let msgs = p.handle_you_may_read(array, vec![(tile(0), Fingerprint([0u8; 32]))]);
		assert!(msgs.is_empty(), "only one of two tiles ready");

		let msgs = p.handle_you_may_read(array, vec![(tile(1), Fingerprint([0u8; 32]))]);
		assert_eq!(msgs.len(), 1);
	}

	#[test]
	fn misaligned_footprint_requests_resample() {
		let mut p = Producer::new(RasterId(0), native());
		let array = ArrayId::new(QueryId(1), 0);
		let skewed = ArrayPlan {
			footprint: Footprint::new((0.5, 0.0), (1.0, 1.0), 0.0, 256, 256),
			tiles: vec![tile(0)],
		};
		p.handle_make_arrays(QueryId(1), vec![(array, skewed)]);
		p.handle_build_now(array);
		let msgs = p.handle_you_may_read(array, vec![(tile(0), Fingerprint([0u8; 32]))]);
		match &msgs[0] {
			Msg::Build { needs_resample, .. } => assert!(*needs_resample),
			_ => panic!("wrong message"),
		}
	}

	#[test]
	fn kill_query_drops_in_flight_arrays() {
		let mut p = Producer::new(RasterId(0), native());
		let array = ArrayId::new(QueryId(1), 0);
		p.handle_make_arrays(QueryId(1), vec![(array, plan(vec![tile(0)]))]);
		p.kill_query(QueryId(1));
		assert!(p.in_flight.is_empty());
	}
}
