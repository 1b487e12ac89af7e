//! `QueriesHandler` (`spec.md` §4.2, per raster): slices a query into
//! production arrays, tracks headroom, and is the only actor that decides
//! when new work may start — bedrooms only release what this actor already
//! signalled room for.
//!
//! Production-array-to-cache-tile overlap is, in the general case, footprint
//! geometry this crate doesn't own (`spec.md` §1 Non-goals). This actor
//! resolves it the one way it *can* without that math: one cache tile per
//! production array, sharing the raster's own tiling grid — exact when the
//! query's footprint matches the raster's native grid, and conservative
//! (forces `Builder` to resample) otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bus::Msg;
use crate::events::EventBus;
use crate::types::{ArrayId, ArrayPlan, QueryId, QueryLifecycle, QuerySpec, QueryState, RasterId, TileId, TileIndex};

/// One item delivered to the consumer via [`crate::handle::QueryHandle`].
pub type QueryItem = Result<Arc<[u8]>, String>;

struct QueryEntry {
	state: QueryState,
	plans: Vec<ArrayPlan>,
	pending_data: HashMap<usize, Arc<[u8]>>,
	sender: mpsc::Sender<QueryItem>,
}

pub struct QueriesHandler {
	raster: RasterId,
	tile_width: u32,
	tile_height: u32,
	events: EventBus,
	queries: HashMap<QueryId, QueryEntry>,
}

impl QueriesHandler {
	#[must_use]
	pub fn new(raster: RasterId, tile_width: u32, tile_height: u32, events: EventBus) -> Self {
		Self {
			raster,
			tile_width,
			tile_height,
			events,
			queries: HashMap::new(),
		}
	}

	/// Decompose `spec`'s footprint into production arrays in delivery order
	/// and register the query, immediately requesting as many arrays as the
	/// fresh output queue has headroom for.
	pub fn post_query(&mut self, id: QueryId, spec: QuerySpec, sender: mpsc::Sender<QueryItem>) -> Vec<Msg> {
		let sub_footprints = spec.footprint.split_into_tiles(self.tile_width, self.tile_height);
		let cols = spec.footprint.width.div_ceil(self.tile_width) as usize;
		let rows = spec.footprint.height.div_ceil(self.tile_height) as usize;
		let order = spec.ordering.order(cols, rows, None);

		let plans: Vec<ArrayPlan> = order
			.into_iter()
			.map(|raw_idx| {
				let footprint = sub_footprints[raw_idx].clone();
				let col = (raw_idx % cols) as u64;
				let row = (raw_idx / cols) as u64;
				let tile = TileId::new(self.raster, TileIndex::new(0, col, row));
				ArrayPlan { footprint, tiles: vec![tile] }
			})
			.collect();

		let array_count = plans.len();
		let raster = spec.raster;
		let mut state = QueryState::new(id, spec, array_count);
		state.lifecycle = QueryLifecycle::Planned;
		self.events.emit(crate::events::Event::QueryPosted { query: id, raster });

		let mut entry = QueryEntry {
			state,
			plans,
			pending_data: HashMap::new(),
			sender,
		};
		let mut msgs = self.dispatch_next(&mut entry, 0);
		// Tell the bedrooms the freshly-registered query's starting headroom
		// right away — otherwise `BuildWhenReady` for its first batch of
		// arrays would wait forever for an `output_queue_update` that only
		// `handle_made_array` would otherwise ever send.
		msgs.push(Msg::OutputQueueUpdate {
			raster: self.raster,
			query: id,
			headroom: entry.state.allowed_concurrency(),
		});
		self.queries.insert(id, entry);
		msgs
	}

	fn dispatch_next(&self, entry: &mut QueryEntry, already_dispatched: usize) -> Vec<Msg> {
		let headroom = entry.state.allowed_concurrency();
		let start = already_dispatched;
		let end = (start + headroom).min(entry.plans.len());
		if start >= end {
			return Vec::new();
		}
		let arrays: Vec<(ArrayId, ArrayPlan)> = (start..end).map(|i| (ArrayId::new(entry.state.id, i), entry.plans[i].clone())).collect();
		entry.state.in_flight_count += arrays.len();
		vec![Msg::MakeArrays {
			raster: self.raster,
			query: entry.state.id,
			arrays,
		}]
	}

	/// `made_array(array, data)` from `Producer`: deliver any now-contiguous
	/// prefix, then top up in-flight work and notify the bedrooms.
	pub fn handle_made_array(&mut self, array: ArrayId, data: Arc<[u8]>) -> Vec<Msg> {
		let Some(entry) = self.queries.get_mut(&array.query) else { return Vec::new() };
		entry.pending_data.insert(array.tile_index, data);
		entry.state.mark_ready(array.tile_index);
		self.drain_ready_and_continue(array.query)
	}

	/// `retry_delivery(query)`: the consumer just drained an item from its
	/// channel (`QueryHandle::next`), so retry any arrays that were ready but
	/// got stuck behind a full channel (`spec.md` §8 property 2). Without
	/// this, a query whose consumer briefly falls behind would never resume:
	/// nothing else re-enters `handle_made_array` once in-flight production
	/// has drained to zero headroom.
	pub fn handle_retry_delivery(&mut self, query: QueryId) -> Vec<Msg> {
		if !self.queries.contains_key(&query) {
			return Vec::new();
		}
		self.drain_ready_and_continue(query)
	}

	/// Deliver as much of the ready-but-undelivered prefix as the output
	/// channel currently accepts, then top up in-flight work and notify the
	/// bedrooms. Shared by [`Self::handle_made_array`] and
	/// [`Self::handle_retry_delivery`] so both go through the exact same
	/// delivery-confirmation logic.
	fn drain_ready_and_continue(&mut self, query: QueryId) -> Vec<Msg> {
		let Some(entry) = self.queries.get_mut(&query) else { return Vec::new() };

		while entry.state.next_deliverable() {
			let idx = entry.state.delivered_count;
			let Some(bytes) = entry.pending_data.get(&idx).cloned() else { break };
			match entry.sender.try_send(Ok(bytes)) {
				Ok(()) => {
					entry.pending_data.remove(&idx);
					entry.state.confirm_delivered();
					self.events.emit(crate::events::Event::QueryDelivered {
						query,
						array: ArrayId::new(query, idx),
					});
					if !entry.state.is_complete() && entry.state.lifecycle == QueryLifecycle::Planned {
						entry.state.lifecycle = QueryLifecycle::Draining;
					}
				}
				// Channel momentarily full: leave this (and everything after
				// it) in `ready_not_delivered`. `allowed_concurrency()` will
				// correctly stop admitting new work until a future
				// `RetryDelivery` (or another completed array) drains it.
				Err(mpsc::error::TrySendError::Full(_)) => break,
				Err(mpsc::error::TrySendError::Closed(_)) => {
					entry.state.cancelled = true;
					entry.state.lifecycle = QueryLifecycle::Cancelling;
					break;
				}
			}
		}

		if entry.state.cancelled {
			self.events.emit(crate::events::Event::QueryCancelled { query });
			self.queries.remove(&query);
			return vec![Msg::KillQuery { raster: self.raster, query }];
		}

		let mut out = Vec::new();
		let already = entry.state.in_flight_count + entry.state.ready_not_delivered.len() + entry.state.delivered_count;
		out.extend(self.dispatch_next(entry, already));
		out.push(Msg::OutputQueueUpdate {
			raster: self.raster,
			query,
			headroom: entry.state.allowed_concurrency(),
		});

		if entry.state.is_complete() {
			entry.state.lifecycle = QueryLifecycle::Done;
			self.events.emit(crate::events::Event::QueryDone { query });
			entry.state.lifecycle = QueryLifecycle::Gone;
			self.queries.remove(&query);
		}
		out
	}

	/// `array_failed(array, error)`: surfaced as a terminal failure; the
	/// query is killed (`spec.md` §7).
	pub fn handle_array_failed(&mut self, array: ArrayId, error: String) -> Vec<Msg> {
		if let Some(entry) = self.queries.get_mut(&array.query) {
			let _ = entry.sender.try_send(Err(error));
			entry.state.lifecycle = QueryLifecycle::Cancelling;
			self.events.emit(crate::events::Event::QueryCancelled { query: array.query });
		}
		vec![Msg::KillQuery { raster: self.raster, query: array.query }]
	}

	/// User-initiated cancellation (`spec.md` §4.12).
	pub fn handle_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		if let Some(entry) = self.queries.get_mut(&query) {
			entry.state.cancelled = true;
			entry.state.lifecycle = QueryLifecycle::Cancelling;
			self.events.emit(crate::events::Event::QueryCancelled { query });
		}
		vec![Msg::KillQuery { raster: self.raster, query }]
	}

	/// `kill_query(query)` broadcast: drop all state for it (`spec.md` §8
	/// property 5).
	pub fn handle_kill_query(&mut self, query: QueryId) {
		self.queries.remove(&query);
	}

	#[must_use]
	pub fn has_query(&self, query: QueryId) -> bool {
		self.queries.contains_key(&query)
	}
}
