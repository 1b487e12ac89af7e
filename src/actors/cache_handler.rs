//! `CacheHandler` (`spec.md` §4.4): per-raster authority on tile state.
//! Decides, for every requested tile, whether to answer immediately, wait,
//! or kick off a check/compute — and is the only actor allowed to mutate a
//! tile's [`TileState`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::bus::{FileStatus, Msg};
use crate::cache::CacheLayout;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::types::{ArrayId, Fingerprint, QueryId, RasterId, TileId, TileIndex, TileRecord, TileState};

/// Derives a tile's fingerprint `H` from its logical inputs (`spec.md` §6).
/// Implemented by the scheduler, which alone knows a raster's channel set,
/// compute-function identity, and how to resolve upstream tile fingerprints
/// across rasters.
pub trait TileFingerprintDeriver: Send + Sync {
	fn fingerprint_for(&self, tile: TileIndex) -> Fingerprint;
}

/// Per-tile bookkeeping beyond what [`TileRecord`] carries: which production
/// arrays are waiting specifically on this tile, to route `you_may_read`
/// once it becomes valid.
#[derive(Default)]
struct Waiters {
	arrays: Vec<ArrayId>,
}

pub struct CacheHandler {
	raster: RasterId,
	/// `None` for a direct-read raster (`RasterSource::StoredFile`/`InMemory`):
	/// there is no on-disk cache to key a `TileRecord` against, so those
	/// rasters never reach any of the methods below that touch it (see
	/// `new_direct` and `handle_may_i_read`'s direct-mode short-circuit).
	layout: Option<CacheLayout>,
	deriver: Option<Box<dyn TileFingerprintDeriver>>,
	retry_cap: u32,
	metrics: Arc<Metrics>,
	events: EventBus,
	tiles: HashMap<TileIndex, TileRecord>,
	waiting: HashMap<TileIndex, Waiters>,
}

impl CacheHandler {
	#[must_use]
	pub fn new(raster: RasterId, layout: CacheLayout, deriver: Box<dyn TileFingerprintDeriver>, retry_cap: u32, metrics: Arc<Metrics>, events: EventBus) -> Self {
		Self {
			raster,
			layout: Some(layout),
			deriver: Some(deriver),
			retry_cap,
			metrics,
			events,
			tiles: HashMap::new(),
			waiting: HashMap::new(),
		}
	}

	/// A `CacheHandler` for a direct-read raster: no cache layout, no
	/// fingerprint deriver, no tile state machine. `handle_may_i_read` answers
	/// every request immediately instead of ever touching `tiles`/`waiting`.
	#[must_use]
	pub fn new_direct(raster: RasterId, metrics: Arc<Metrics>, events: EventBus) -> Self {
		Self {
			raster,
			layout: None,
			deriver: None,
			retry_cap: 0,
			metrics,
			events,
			tiles: HashMap::new(),
			waiting: HashMap::new(),
		}
	}

	fn record_mut(&mut self, index: TileIndex) -> &mut TileRecord {
		let deriver = self.deriver.as_ref().expect("record_mut is only reached for cache-backed rasters");
		self.tiles.entry(index).or_insert_with(|| TileRecord::new(deriver.fingerprint_for(index)))
	}

	/// `may_i_read(tiles)`: the entry point from `Producer`. Replies
	/// immediately with whichever requested tiles are already VALID, and
	/// subscribes the array to the rest, triggering a status check or a
	/// compute request the first time a tile is seen.
	///
	/// For a direct-read raster (no `deriver`), every tile is answered
	/// immediately: there's no cache state machine to run, since `Sampler`
	/// reads straight from the `TileReader` instead of a cache file. The
	/// fingerprint carried in `YouMayRead` is a placeholder in that case —
	/// direct reads never key a file path on it.
	pub fn handle_may_i_read(&mut self, query: QueryId, array: ArrayId, tiles: Vec<TileId>) -> Vec<Msg> {
		if self.deriver.is_none() {
			let ready_tiles = tiles.into_iter().map(|tile| (tile, Fingerprint([0u8; 32]))).collect();
			return vec![Msg::YouMayRead {
				raster: self.raster,
				array,
				ready_tiles,
			}];
		}

		let mut out = Vec::new();
		let mut ready_now = Vec::new();

		for tile in tiles {
			let index = tile.index;
			let is_new = !self.tiles.contains_key(&index);
			let record = self.record_mut(index);

			match record.state {
				TileState::Valid => {
					self.metrics.record_cache_hit();
					ready_now.push((tile, record.fingerprint));
					continue;
				}
				TileState::Absent if is_new => {
					self.metrics.record_cache_miss();
					record.subscribers.insert(query);
					record.state = TileState::Checking;
					self.events.tile_state_changed(tile, TileState::Checking);
					out.push(Msg::StatusRequest {
						raster: self.raster,
						tile,
						fingerprint: record.fingerprint,
					});
				}
				_ => {
					record.subscribers.insert(query);
				}
			}
			self.waiting.entry(index).or_default().arrays.push(array);
		}

		if !ready_now.is_empty() {
			out.push(Msg::YouMayRead {
				raster: self.raster,
				array,
				ready_tiles: ready_now,
			});
		}
		out
	}

	fn release_waiters(&mut self, tile: TileId, fingerprint: Fingerprint) -> Vec<Msg> {
		let Some(waiters) = self.waiting.remove(&tile.index) else {
			return Vec::new();
		};
		waiters
			.arrays
			.into_iter()
			.map(|array| Msg::YouMayRead {
				raster: self.raster,
				array,
				ready_tiles: vec![(tile, fingerprint)],
			})
			.collect()
	}

	fn fail_waiters(&mut self, tile: TileId, error: &str) -> Vec<Msg> {
		let Some(waiters) = self.waiting.remove(&tile.index) else {
			return Vec::new();
		};
		waiters
			.arrays
			.into_iter()
			.map(|array| Msg::TileFailed {
				raster: self.raster,
				array,
				tile,
				error: error.to_string(),
			})
			.collect()
	}

	/// `status(tile, VALID|CORRUPT|MISSING)` from `FileHasher`.
	pub fn handle_status(&mut self, tile: TileId, status: FileStatus) -> Vec<Msg> {
		let index = tile.index;
		let Some(record) = self.tiles.get_mut(&index) else { return Vec::new() };

		match status {
			FileStatus::Valid => {
				record.state = TileState::Valid;
				self.events.tile_state_changed(tile, TileState::Valid);
				let fingerprint = record.fingerprint;
				self.release_waiters(tile, fingerprint)
			}
			FileStatus::Missing => {
				record.state = TileState::Absent;
				self.begin_compute(tile)
			}
			FileStatus::Corrupt => {
				let layout = self.layout.as_ref().expect("handle_status is only reached for cache-backed rasters");
				let _ = layout.delete(index, record.fingerprint);
				record.state = TileState::Absent;
				self.events.warn(format!("tile {tile} was corrupt on disk, recomputing"));
				self.begin_compute(tile)
			}
		}
	}

	fn begin_compute(&mut self, tile: TileId) -> Vec<Msg> {
		let index = tile.index;
		let record = self.tiles.get_mut(&index).expect("record exists");
		record.state = TileState::Computing;
		self.events.tile_state_changed(tile, TileState::Computing);
		let queries: Vec<QueryId> = record.subscribers.iter().copied().collect();
		vec![Msg::ComputeTiles {
			raster: self.raster,
			tiles: vec![(tile, record.fingerprint, queries)],
		}]
	}

	/// `wrote_tile(tile)` from `Writer`: transitions `WRITING -> VALID`.
	pub fn handle_wrote_tile(&mut self, tile: TileId) -> Vec<Msg> {
		let index = tile.index;
		let Some(record) = self.tiles.get_mut(&index) else { return Vec::new() };
		record.state = TileState::Valid;
		record.retry_count = 0;
		self.events.tile_state_changed(tile, TileState::Valid);
		let fingerprint = record.fingerprint;
		self.release_waiters(tile, fingerprint)
	}

	/// `wrote_failed(tile, error)`: transient I/O error. Retries by
	/// re-entering `Computing` up to the configured cap; beyond that,
	/// surfaces as a terminal failure to every waiting array (`spec.md` §7).
	pub fn handle_wrote_failed(&mut self, tile: TileId, error: String) -> Vec<Msg> {
		let index = tile.index;
		let Some(record) = self.tiles.get_mut(&index) else { return Vec::new() };
		record.retry_count += 1;
		if record.retry_count > self.retry_cap {
			record.state = TileState::Absent;
			self.events.error(format!("tile {tile} failed permanently after {} retries: {error}", self.retry_cap));
			return self.fail_waiters(tile, &error);
		}
		log::warn!(target: "scheduler::cache", "tile {tile} write failed (retry {}/{}): {error}", record.retry_count, self.retry_cap);
		self.begin_compute(tile)
	}

	/// `compute_failed(tile, error)` from `Computer`/`Merger`: same retry
	/// policy as write failures.
	pub fn handle_compute_failed(&mut self, tile: TileId, error: String) -> Vec<Msg> {
		self.handle_wrote_failed(tile, error)
	}

	/// Drop every reservation this query holds: remove it from subscriber
	/// sets and waiting lists (`spec.md` §4.12 invariant 3/5). Does not
	/// cancel in-flight pool tasks — `Computer`/`Writer` own that via their
	/// own `kill_query` handling.
	pub fn kill_query(&mut self, query: QueryId) {
		for record in self.tiles.values_mut() {
			record.subscribers.remove(&query);
		}
		for waiters in self.waiting.values_mut() {
			waiters.arrays.retain(|a| a.query != query);
		}
	}

	#[must_use]
	pub fn tile_state(&self, index: TileIndex) -> Option<&TileState> {
		self.tiles.get(&index).map(|r| &r.state)
	}

	#[must_use]
	pub fn known_tiles(&self) -> HashSet<TileIndex> {
		self.tiles.keys().copied().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	struct FixedDeriver;
	impl TileFingerprintDeriver for FixedDeriver {
		fn fingerprint_for(&self, index: TileIndex) -> Fingerprint {
			let mut b = [0u8; 32];
			b[0] = index.level as u8;
			b[1] = index.x as u8;
			b[2] = index.y as u8;
			Fingerprint(b)
		}
	}

	fn handler() -> CacheHandler {
		let dir = tempdir().unwrap();
		CacheHandler::new(RasterId(0), CacheLayout::new(dir.path().to_path_buf(), "tile"), Box::new(FixedDeriver), 3, Arc::new(Metrics::default()), EventBus::new())
	}

	fn tile(i: u64) -> TileId {
		TileId::new(RasterId(0), TileIndex::new(0, i, 0))
	}

	#[test]
	fn first_request_for_absent_tile_triggers_status_check() {
		let mut h = handler();
		let array = ArrayId::new(QueryId(1), 0);
		let msgs = h.handle_may_i_read(QueryId(1), array, vec![tile(0)]);
		assert_eq!(msgs.len(), 1);
		assert!(matches!(msgs[0], Msg::StatusRequest { .. }));
	}

	#[test]
	fn second_request_for_same_tile_does_not_duplicate_status_check() {
		let mut h = handler();
		let array1 = ArrayId::new(QueryId(1), 0);
		let array2 = ArrayId::new(QueryId(2), 0);
		h.handle_may_i_read(QueryId(1), array1, vec![tile(0)]);
		let msgs = h.handle_may_i_read(QueryId(2), array2, vec![tile(0)]);
		assert!(msgs.is_empty());
	}

	#[test]
	fn missing_status_triggers_compute_then_write_then_ready() {
		let mut h = handler();
		let array = ArrayId::new(QueryId(1), 0);
		h.handle_may_i_read(QueryId(1), array, vec![tile(0)]);

		let msgs = h.handle_status(tile(0), FileStatus::Missing);
		assert!(matches!(msgs[0], Msg::ComputeTiles { .. }));
		assert_eq!(h.tile_state(TileIndex::new(0, 0, 0)), Some(&TileState::Computing));

		let msgs = h.handle_wrote_tile(tile(0));
		assert_eq!(msgs.len(), 1);
		match &msgs[0] {
			Msg::YouMayRead { ready_tiles, .. } => assert_eq!(ready_tiles[0].0, tile(0)),
			_ => panic!("wrong message"),
		}
		assert_eq!(h.tile_state(TileIndex::new(0, 0, 0)), Some(&TileState::Valid));
	}

	#[test]
	fn valid_status_answers_immediately_on_next_request() {
		let mut h = handler();
		let array1 = ArrayId::new(QueryId(1), 0);
		h.handle_may_i_read(QueryId(1), array1, vec![tile(0)]);
		h.handle_status(tile(0), FileStatus::Valid);

		let array2 = ArrayId::new(QueryId(2), 0);
		let msgs = h.handle_may_i_read(QueryId(2), array2, vec![tile(0)]);
		assert_eq!(msgs.len(), 1);
		assert!(matches!(msgs[0], Msg::YouMayRead { .. }));
	}

	#[test]
	fn corrupt_status_deletes_and_recomputes() {
		let mut h = handler();
		let array = ArrayId::new(QueryId(1), 0);
		h.handle_may_i_read(QueryId(1), array, vec![tile(0)]);
		let msgs = h.handle_status(tile(0), FileStatus::Corrupt);
		assert!(matches!(msgs[0], Msg::ComputeTiles { .. }));
	}

	#[test]
	fn write_failure_beyond_retry_cap_fails_waiters() {
		let mut h = handler();
		let array = ArrayId::new(QueryId(1), 0);
		h.handle_may_i_read(QueryId(1), array, vec![tile(0)]);
		h.handle_status(tile(0), FileStatus::Missing);

		for _ in 0..3 {
			let msgs = h.handle_wrote_failed(tile(0), "disk full".into());
			assert!(matches!(msgs[0], Msg::ComputeTiles { .. }));
		}
		let msgs = h.handle_wrote_failed(tile(0), "disk full".into());
		assert_eq!(msgs.len(), 1);
		assert!(matches!(msgs[0], Msg::TileFailed { .. }));
	}

	#[test]
	fn kill_query_drops_its_subscriptions() {
		let mut h = handler();
		let array = ArrayId::new(QueryId(1), 0);
		h.handle_may_i_read(QueryId(1), array, vec![tile(0)]);
		h.kill_query(QueryId(1));
		// tile still pending, but query 1's subscriber entry is gone
		let record = h.tiles.get(&TileIndex::new(0, 0, 0)).unwrap();
		assert!(!record.subscribers.contains(&QueryId(1)));
	}

	#[test]
	fn direct_mode_answers_every_tile_immediately() {
		let mut h = CacheHandler::new_direct(RasterId(0), Arc::new(Metrics::default()), EventBus::new());
		let array = ArrayId::new(QueryId(1), 0);
		let msgs = h.handle_may_i_read(QueryId(1), array, vec![tile(0), tile(1)]);
		assert_eq!(msgs.len(), 1);
		match &msgs[0] {
			Msg::YouMayRead { ready_tiles, .. } => assert_eq!(ready_tiles.len(), 2),
			_ => panic!("wrong message"),
		}
		// no cache state machine runs for direct-mode tiles
		assert!(h.known_tiles().is_empty());
	}

	#[test]
	fn tile_state_changes_emit_events() {
		use parking_lot::Mutex;
		let seen = Arc::new(Mutex::new(Vec::new()));
		let events = EventBus::new();
		{
			let seen = seen.clone();
			events.subscribe(move |event| {
				if let crate::events::Event::TileStateChanged { to, .. } = event {
					seen.lock().push(*to);
				}
			});
		}
		let dir = tempdir().unwrap();
		let mut h = CacheHandler::new(RasterId(0), CacheLayout::new(dir.path().to_path_buf(), "tile"), Box::new(FixedDeriver), 3, Arc::new(Metrics::default()), events);
		let array = ArrayId::new(QueryId(1), 0);
		h.handle_may_i_read(QueryId(1), array, vec![tile(0)]);
		h.handle_status(tile(0), FileStatus::Missing);
		h.handle_wrote_tile(tile(0));
		assert_eq!(*seen.lock(), vec![TileState::Checking, TileState::Computing, TileState::Valid]);
	}
}
