//! The message bus: every inter-actor edge in `spec.md` §2's dataflow
//! diagram as one variant of [`Msg`], plus the depth-first dispatcher
//! (`spec.md` §5, §9 design notes).
//!
//! Depth-first delivery is implemented with an explicit work-list rather
//! than recursive calls, to keep stack depth bounded: a handler's emitted
//! messages are pushed onto a LIFO on top of the current FIFO mailbox, and
//! fully drained before the loop returns to anything queued earlier. This is
//! the "LIFO of emitted messages within a handler's synchronous descent"
//! the design notes call for.

use std::sync::Arc;

use crate::types::{ArrayId, ArrayPlan, Fingerprint, QueryId, RasterId, TileId};

/// One partial compute output plus the sub-extent it covers, as it travels
/// from `Computer` to `ComputeAccumulator`.
#[derive(Debug, Clone)]
pub struct PartialMsg {
	pub sub_extent: (u64, u64),
	pub data: Arc<[u8]>,
}

/// All inter-actor messages. Every per-raster variant carries its
/// `RasterId` so the dispatcher can route it to that raster's actor set
/// without a separate addressing scheme.
#[derive(Debug, Clone)]
pub enum Msg {
	// -- lifecycle, fanned out by RastersHandler / public API --
	// Posting a query is handled synchronously by `Scheduler::post_query`
	// (it needs to hand the caller back an output-queue receiver, which
	// doesn't fit this bus's fire-and-forget shape) rather than through a
	// `Msg` variant; cancellation and kill still flow through the bus since
	// they carry no such out-of-band return value.
	CancelQuery { raster: RasterId, query: QueryId },
	KillQuery { raster: RasterId, query: QueryId },
	KillRaster { raster: RasterId },
	/// Fired by `QueryHandle` after the consumer drains an item from its
	/// channel, so arrays stuck in `ready_not_delivered` behind an
	/// earlier-full channel get another delivery attempt (`spec.md` §8
	/// property 2 — a full output queue must never silently stall forever).
	RetryDelivery { raster: RasterId, query: QueryId },

	// -- QueriesHandler -> Producer --
	MakeArrays { raster: RasterId, query: QueryId, arrays: Vec<(ArrayId, ArrayPlan)> },

	// -- Producer -> CacheHandler / CacheHandler -> Producer --
	// `ready_tiles` carries each tile's fingerprint alongside its id: only
	// CacheHandler derives `H`, and Sampler needs it to form the cache path,
	// so it rides along rather than being re-derived downstream.
	MayIRead { raster: RasterId, query: QueryId, array: ArrayId, tiles: Vec<TileId> },
	YouMayRead { raster: RasterId, array: ArrayId, ready_tiles: Vec<(TileId, Fingerprint)> },
	TileFailed { raster: RasterId, array: ArrayId, tile: TileId, error: String },

	// -- Producer <-> BuilderBedroom --
	BuildWhenReady { raster: RasterId, array: ArrayId },
	BuildNow { raster: RasterId, array: ArrayId },

	// -- Producer -> Builder / Builder -> Producer --
	// `needs_resample` is decided by Producer, the only actor holding both
	// the query's target footprint and the raster's native tile footprint
	// (`spec.md` §4.10).
	Build {
		raster: RasterId,
		array: ArrayId,
		tiles: Vec<(TileId, Fingerprint)>,
		needs_resample: bool,
	},
	Built { raster: RasterId, array: ArrayId, data: Arc<[u8]> },
	BuildFailed { raster: RasterId, array: ArrayId, error: String },

	// -- Builder -> Sampler / Sampler -> Builder --
	Sample { raster: RasterId, array: ArrayId, tiles: Vec<(TileId, Fingerprint)> },
	Sampled { raster: RasterId, array: ArrayId, data: Vec<(TileId, Arc<[u8]>)> },

	// -- Builder -> Resampler / Resampler -> Builder --
	Resample { raster: RasterId, array: ArrayId, data: Vec<(TileId, Arc<[u8]>)> },
	Resampled { raster: RasterId, array: ArrayId, data: Arc<[u8]> },

	// -- Producer -> QueriesHandler --
	MadeArray { raster: RasterId, query: QueryId, array: ArrayId, data: Arc<[u8]> },
	ArrayFailed { raster: RasterId, query: QueryId, array: ArrayId, error: String },

	// -- QueriesHandler -> {ComputationBedroom, BuilderBedroom} --
	OutputQueueUpdate { raster: RasterId, query: QueryId, headroom: usize },

	// -- CacheHandler -> FileHasher / FileHasher -> CacheHandler --
	StatusRequest { raster: RasterId, tile: TileId, fingerprint: Fingerprint },
	Status { raster: RasterId, tile: TileId, status: FileStatus },

	// -- CacheHandler -> Computer --
	// `queries` are the subscribers currently interested in each tile, so
	// ComputationBedroom can tell whether *some* dependent query has output
	// headroom without re-deriving tile->query interest itself. `fingerprint`
	// rides along from here through to `Writer`, since cache paths are keyed
	// on `(tile, fingerprint)` and only CacheHandler derives it.
	ComputeTiles { raster: RasterId, tiles: Vec<(TileId, Fingerprint, Vec<QueryId>)> },

	// -- ComputationBedroom -> Computer --
	// ComputationBedroom's own admission decision (`schedule_compute_when_needed`)
	// is driven directly off `ComputeTiles`'s tile list, not a separate `Msg`.
	ScheduleCompute { raster: RasterId, tile: TileId, fingerprint: Fingerprint },

	// -- Computer -> ComputeAccumulator --
	// `total` is the number of partials the compute function declared up
	// front for this tile, so the accumulator can detect completeness by
	// arrival count without inspecting sub-extents itself.
	ComputedPartial {
		raster: RasterId,
		tile: TileId,
		fingerprint: Fingerprint,
		partial: PartialMsg,
		total: usize,
	},
	ComputeFailed { raster: RasterId, tile: TileId, error: String },

	// -- ComputeAccumulator -> Merger --
	MergeTile { raster: RasterId, tile: TileId, fingerprint: Fingerprint, partials: Vec<PartialMsg> },

	// -- Merger -> Writer --
	WriteTile { raster: RasterId, tile: TileId, fingerprint: Fingerprint, data: Arc<[u8]> },

	// -- Writer -> CacheHandler --
	WroteTile { raster: RasterId, tile: TileId },
	WroteFailed { raster: RasterId, tile: TileId, error: String },
}

/// Result of [`crate::actors::file_hasher::FileHasher`] validating (or
/// failing to find) a tile on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
	Missing,
	Valid,
	Corrupt,
}

/// Drain `seed` and everything it (transitively) emits, depth-first, handing
/// each message to `handle`. `handle` returns the messages that single step
/// produced; this function owns only the traversal order, not any actor
/// state.
pub fn drain_depth_first<F>(seed: Vec<Msg>, mut handle: F)
where
	F: FnMut(Msg) -> Vec<Msg>,
{
	// `stack` is the LIFO: messages are popped from the back (most recently
	// pushed = most recently emitted) so that a handler's own reactions are
	// fully resolved before we return to its siblings.
	let mut stack: Vec<Msg> = seed.into_iter().rev().collect();
	while let Some(msg) = stack.pop() {
		let emitted = handle(msg);
		// push in reverse so emitted[0] is popped first, preserving the
		// handler's own emission order as the depth-first visiting order.
		stack.extend(emitted.into_iter().rev());
	}
}
