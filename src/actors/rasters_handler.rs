//! `RastersHandler` (`spec.md` §4.1): the top-level actor. Owns one instance
//! of every other actor per registered raster, accepts registrations, and
//! is the sole [`crate::bus::Msg`] dispatcher — every other actor's
//! `handle_*` method is reached only through [`RastersHandler::dispatch`].
//!
//! Two cross-raster concerns — a tile's fingerprint derivation and reading
//! an upstream raster's tile bytes — need visibility into rasters other
//! than their own, which no individual per-raster actor has by design
//! (`spec.md` §9: "no ownership cycles"). This module is where that
//! visibility actually lives: a small shared registry
//! (`dashmap::DashMap`, matching the teacher's use of `dashmap` for
//! concurrent lookups) that [`SharedDeriver`] and [`SharedUpstreamReader`]
//! close over. Only cache-backed rasters (`RasterSource::Recipe` with a
//! `cache_dir`) are entered into this registry: a `StoredFile`/`InMemory`
//! raster has nothing for `SharedDeriver` to recurse into (no compute
//! function, no fingerprint-derivation inputs), so it is deliberately
//! excluded from ever serving as another raster's upstream dependency.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::Msg;
use crate::cache::CacheLayout;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::types::{compute_fingerprint, ChannelSet, ComputeFn, Fingerprint, FingerprintInputs, Footprint, IdGenerator, QueryId, QuerySpec, RasterId, RasterSpec, TileIndex, TileReader};

use super::builder::Builder;
use super::builder_bedroom::BuilderBedroom;
use super::cache_handler::{CacheHandler, TileFingerprintDeriver};
use super::computation_bedroom::ComputationBedroom;
use super::compute_accumulator::ComputeAccumulator;
use super::computer::{Computer, UpstreamReader};
use super::file_hasher::FileHasher;
use super::merger::Merger;
use super::producer::Producer;
use super::queries_handler::{QueriesHandler, QueryItem};
use super::resampler::{Resample, Resampler};
use super::sampler::{Sampler, TileSource};
use super::writer::Writer;

struct RasterRegistryEntry {
	channels: Vec<String>,
	compute_fn: Arc<dyn ComputeFn>,
	layout: CacheLayout,
}

/// Derives `H` for a tile by recursing into the shared registry for its
/// upstream dependencies (`spec.md` §6).
struct SharedDeriver {
	raster: RasterId,
	registry: Arc<DashMap<RasterId, RasterRegistryEntry>>,
}

impl TileFingerprintDeriver for SharedDeriver {
	fn fingerprint_for(&self, tile: TileIndex) -> Fingerprint {
		let entry = self.registry.get(&self.raster).expect("raster registered before its CacheHandler can ask for a fingerprint");
		let upstream_tiles = entry.compute_fn.upstream_dependencies(self.raster, tile);
		let channels = entry.channels.clone();
		let compute_fn_id = entry.compute_fn.id().to_string();
		let compute_fn_version = entry.compute_fn.version().to_string();
		drop(entry);

		let upstream: Vec<Fingerprint> = upstream_tiles
			.iter()
			.map(|dep| {
				SharedDeriver {
					raster: dep.raster,
					registry: self.registry.clone(),
				}
				.fingerprint_for(dep.index)
			})
			.collect();

		compute_fingerprint(&FingerprintInputs {
			tile_index: tile,
			channels: &channels,
			compute_fn_id: &compute_fn_id,
			compute_fn_version: &compute_fn_version,
			upstream: &upstream,
		})
	}
}

/// Reads an upstream raster's tile bytes straight off its cache, deriving
/// the fingerprint the same way [`SharedDeriver`] would (`spec.md` §6:
/// "forming a DAG resolved by the same scheduler").
struct SharedUpstreamReader {
	registry: Arc<DashMap<RasterId, RasterRegistryEntry>>,
}

impl UpstreamReader for SharedUpstreamReader {
	fn read_upstream_tile(&self, raster: RasterId, index: TileIndex) -> Result<Arc<[u8]>> {
		let entry = self.registry.get(&raster).ok_or_else(|| anyhow!("upstream raster {raster} is not registered"))?;
		let layout = entry.layout.clone();
		drop(entry);
		let fingerprint = SharedDeriver {
			raster,
			registry: self.registry.clone(),
		}
		.fingerprint_for(index);
		let bytes = layout
			.read(index, fingerprint)
			.with_context(|| format!("reading upstream tile {index} of {raster}"))?
			.ok_or_else(|| anyhow!("upstream tile {index} of {raster} is not cached yet"))?;
		let payload = crate::cache::unframe(&bytes).ok_or_else(|| anyhow!("upstream tile {index} of {raster} has a corrupt frame"))?;
		Ok(Arc::from(payload))
	}
}

/// The actors that exist only for cache-backed (recipe) rasters: the whole
/// compute-then-cache pipeline `spec.md` §4.4-4.11 describes. A direct-read
/// raster (`RasterSource::StoredFile`/`InMemory`) has no analog for any of
/// these — `Sampler` reads its bytes straight through a `TileReader` instead.
struct ComputePipeline {
	file_hasher: FileHasher,
	computation_bedroom: ComputationBedroom,
	compute_accumulator: ComputeAccumulator,
	computer: Computer,
	merger: Merger,
	writer: Writer,
}

/// One registered raster's full actor set (`spec.md` §4.1). `compute` is
/// `None` for direct-read rasters.
struct RasterActors {
	queries_handler: QueriesHandler,
	producer: Producer,
	cache_handler: CacheHandler,
	builder_bedroom: BuilderBedroom,
	sampler: Sampler,
	resampler: Resampler,
	builder: Builder,
	compute: Option<ComputePipeline>,
	/// Copied out of the registration `RasterSpec` so `post_query` can
	/// validate a query's channels/footprint without re-touching `registry`
	/// (which, for direct-read rasters, holds no entry at all).
	channels: ChannelSet,
	native_footprint: Footprint,
}

pub struct RastersHandler {
	rasters: HashMap<RasterId, RasterActors>,
	registry: Arc<DashMap<RasterId, RasterRegistryEntry>>,
	ids: IdGenerator,
	config: SchedulerConfig,
	events: EventBus,
	metrics: Arc<Metrics>,
	io_pool: Arc<dyn WorkerPool>,
	compute_pool: Arc<dyn WorkerPool>,
	reply: UnboundedSender<Msg>,
}

impl RastersHandler {
	#[must_use]
	pub fn new(config: SchedulerConfig, events: EventBus, metrics: Arc<Metrics>, io_pool: Arc<dyn WorkerPool>, compute_pool: Arc<dyn WorkerPool>, reply: UnboundedSender<Msg>) -> Self {
		Self {
			rasters: HashMap::new(),
			registry: Arc::new(DashMap::new()),
			ids: IdGenerator::new(),
			config,
			events,
			metrics,
			io_pool,
			compute_pool,
			reply,
		}
	}

	/// Register a raster, returning its fresh id. Per `SPEC_FULL.md` §11(c),
	/// rasters can only declare upstream dependencies on already-registered
	/// *cache-backed* rasters: since ids are handed out monotonically and
	/// never reused, no raster can ever reach itself through
	/// `upstream_rasters`, so this check alone is sufficient acyclicity proof
	/// without a DFS.
	///
	/// All three `RasterSource` kinds (`spec.md` §1, §3) are supported:
	/// `Recipe` with a `cache_dir` gets the full compute-then-cache pipeline;
	/// `StoredFile`/`InMemory` get a minimal direct-read path that bypasses
	/// it entirely, reading tile bytes straight through their `TileReader`.
	/// A `Recipe` with no `cache_dir` is the one combination this crate still
	/// declines: a bare in-memory cache of computed tiles would need its own
	/// eviction policy this crate doesn't implement (see DESIGN.md).
	pub fn register_raster(&mut self, spec: RasterSpec, resample_kernel: Arc<dyn Resample>) -> Result<RasterId> {
		for up in &spec.upstream_rasters {
			if !self.registry.contains_key(up) {
				bail!(SchedulerError::ConfigError(format!(
					"upstream raster {up} is not a registered cache-backed raster (direct-read rasters cannot serve as upstream dependencies)"
				)));
			}
		}

		let id = self.ids.next_raster_id();

		let actors = if let Some(cache_dir) = spec.cache_dir().cloned() {
			let compute_fn = spec.compute_fn().expect("cache_dir() is Some only for Recipe sources").clone();
			self.build_cached_actors(id, &spec, compute_fn, cache_dir, resample_kernel)?
		} else if let Some(reader) = spec.tile_reader().cloned() {
			self.build_direct_actors(id, &spec, reader, resample_kernel)
		} else {
			bail!(SchedulerError::ConfigError(
				"recipe raster has no cache_dir; uncached recipes are not supported (set cache_dir, or use a StoredFile/InMemory source)".into()
			));
		};

		self.rasters.insert(id, actors);
		Ok(id)
	}

	fn build_cached_actors(&mut self, id: RasterId, spec: &RasterSpec, compute_fn: Arc<dyn ComputeFn>, cache_dir: PathBuf, resample_kernel: Arc<dyn Resample>) -> Result<RasterActors> {
		let layout = CacheLayout::new(cache_dir, "tile");
		layout.ensure_dir().with_context(|| format!("preparing cache directory for {id}"))?;

		self.registry.insert(
			id,
			RasterRegistryEntry {
				channels: spec.channels.as_slice().to_vec(),
				compute_fn: compute_fn.clone(),
				layout: layout.clone(),
			},
		);

		let deriver = Box::new(SharedDeriver { raster: id, registry: self.registry.clone() });
		let upstream_reader = Arc::new(SharedUpstreamReader { registry: self.registry.clone() });

		let compute = ComputePipeline {
			file_hasher: FileHasher::new(id, layout.clone(), &self.config),
			computation_bedroom: ComputationBedroom::new(id),
			compute_accumulator: ComputeAccumulator::new(id, self.events.clone()),
			computer: Computer::new(id, compute_fn, upstream_reader, self.metrics.clone()),
			merger: Merger::new(id),
			writer: Writer::new(id, layout.clone(), self.metrics.clone(), self.events.clone()),
		};

		Ok(RasterActors {
			queries_handler: QueriesHandler::new(id, spec.tile_width, spec.tile_height, self.events.clone()),
			producer: Producer::new(id, spec.native_footprint.clone()),
			cache_handler: CacheHandler::new(id, layout.clone(), deriver, self.config.io_retry_cap, self.metrics.clone(), self.events.clone()),
			builder_bedroom: BuilderBedroom::new(id),
			sampler: Sampler::new(id, TileSource::Cached(layout), self.config.io_pool_size),
			resampler: Resampler::new(id, resample_kernel, self.config.compute_pool_size),
			builder: Builder::new(id),
			compute: Some(compute),
			channels: spec.channels.clone(),
			native_footprint: spec.native_footprint.clone(),
		})
	}

	fn build_direct_actors(&mut self, id: RasterId, spec: &RasterSpec, reader: Arc<dyn TileReader>, resample_kernel: Arc<dyn Resample>) -> RasterActors {
		RasterActors {
			queries_handler: QueriesHandler::new(id, spec.tile_width, spec.tile_height, self.events.clone()),
			producer: Producer::new(id, spec.native_footprint.clone()),
			cache_handler: CacheHandler::new_direct(id, self.metrics.clone(), self.events.clone()),
			builder_bedroom: BuilderBedroom::new(id),
			sampler: Sampler::new(id, TileSource::Direct(reader), self.config.io_pool_size),
			resampler: Resampler::new(id, resample_kernel, self.config.compute_pool_size),
			builder: Builder::new(id),
			compute: None,
			channels: spec.channels.clone(),
			native_footprint: spec.native_footprint.clone(),
		}
	}

	/// Tear down a raster: every in-flight query's output channel is simply
	/// dropped (the consumer observes end-of-stream), matching `spec.md`
	/// §4.1's close semantics.
	pub fn close_raster(&mut self, raster: RasterId) {
		self.rasters.remove(&raster);
		self.registry.remove(&raster);
		self.events.emit(crate::events::Event::RasterClosed { raster });
	}

	#[must_use]
	pub fn is_registered(&self, raster: RasterId) -> bool {
		self.rasters.contains_key(&raster)
	}

	/// Every currently-registered raster, for broadcast teardown (`Scheduler::shutdown`).
	#[must_use]
	pub fn raster_ids(&self) -> Vec<RasterId> {
		self.rasters.keys().copied().collect()
	}

	pub fn next_query_id(&self) -> QueryId {
		self.ids.next_query_id()
	}

	/// Entry point for `Scheduler::post_query`: validates the query against
	/// its raster's channel set and native footprint (`spec.md` §7: a
	/// `ConfigError` for "invalid query parameters (footprint incompatible
	/// with raster)"), then constructs the query's decomposition and kicks
	/// off the first batch of production arrays. Not a `Msg` variant (see
	/// `bus.rs`) because it needs to hand the caller an output-queue
	/// receiver synchronously.
	pub fn post_query(&mut self, raster: RasterId, query: QueryId, spec: QuerySpec, sender: tokio::sync::mpsc::Sender<QueryItem>) -> Result<Vec<Msg>> {
		let Some(ra) = self.rasters.get_mut(&raster) else {
			bail!(SchedulerError::ConfigError(format!("raster {raster} is not registered")));
		};
		if !ra.channels.contains_all(&spec.channels) {
			bail!(SchedulerError::ConfigError(format!(
				"query requests channels {:?} not all present in raster {raster}'s channel set {:?}",
				spec.channels.as_slice(),
				ra.channels.as_slice()
			)));
		}
		if !spec.footprint.is_aligned_with(&ra.native_footprint) {
			bail!(SchedulerError::ConfigError(format!("query footprint is not grid-aligned with raster {raster}'s native footprint")));
		}
		Ok(ra.queries_handler.post_query(query, spec, sender))
	}

	/// Drain every message `seed` (transitively) produces, depth-first
	/// (`spec.md` §5, §9).
	pub fn drain(&mut self, seed: Vec<Msg>) {
		let events = self.events.clone();
		crate::bus::drain_depth_first(seed, |msg| {
			let handled = format!("{msg:?}");
			let out = self.dispatch(msg);
			events.log(crate::events::LogLevel::Trace, "scheduler", handled);
			out
		});
	}

	fn dispatch(&mut self, msg: Msg) -> Vec<Msg> {
		match msg {
			Msg::CancelQuery { raster, query } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.queries_handler.handle_cancel_query(query)),
			Msg::RetryDelivery { raster, query } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.queries_handler.handle_retry_delivery(query)),
			Msg::KillQuery { raster, query } => {
				if let Some(ra) = self.rasters.get_mut(&raster) {
					ra.queries_handler.handle_kill_query(query);
					ra.producer.kill_query(query);
					ra.cache_handler.kill_query(query);
					if let Some(compute) = ra.compute.as_mut() {
						compute.computation_bedroom.kill_query(query);
					}
					ra.builder_bedroom.kill_query(query);
				}
				Vec::new()
			}
			Msg::KillRaster { raster } => {
				self.close_raster(raster);
				Vec::new()
			}

			Msg::MakeArrays { raster, query, arrays } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.producer.handle_make_arrays(query, arrays)),

			Msg::MayIRead { raster, query, array, tiles } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.cache_handler.handle_may_i_read(query, array, tiles)),
			Msg::YouMayRead { raster, array, ready_tiles } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.producer.handle_you_may_read(array, ready_tiles)),
			Msg::TileFailed { raster, array, error, .. } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.producer.handle_tile_failed(array.query, array, error)),

			Msg::BuildWhenReady { raster, array } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.builder_bedroom.build_when_ready(array.query, array)),
			Msg::BuildNow { raster, array } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.producer.handle_build_now(array)),

			Msg::Build { raster, array, tiles, needs_resample } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.builder.handle_build(array, tiles, needs_resample)),
			Msg::Built { raster, array, data } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.producer.handle_built(array.query, array, data)),
			Msg::BuildFailed { raster, array, error } => {
				let Some(ra) = self.rasters.get_mut(&raster) else { return Vec::new() };
				ra.sampler.task_completed(self.io_pool.as_ref(), &self.reply);
				ra.resampler.task_completed(self.compute_pool.as_ref(), &self.reply);
				ra.builder.kill_array(array);
				ra.producer.handle_build_failed(array.query, array, error)
			}

			Msg::Sample { raster, array, tiles } => {
				if let Some(ra) = self.rasters.get_mut(&raster) {
					ra.sampler.handle_sample(self.io_pool.as_ref(), self.reply.clone(), array, tiles);
				}
				Vec::new()
			}
			Msg::Sampled { raster, array, data } => {
				let Some(ra) = self.rasters.get_mut(&raster) else { return Vec::new() };
				ra.sampler.task_completed(self.io_pool.as_ref(), &self.reply);
				ra.builder.handle_sampled(array, data)
			}

			Msg::Resample { raster, array, data } => {
				if let Some(ra) = self.rasters.get_mut(&raster) {
					ra.resampler.handle_resample(self.compute_pool.as_ref(), self.reply.clone(), array, data);
				}
				Vec::new()
			}
			Msg::Resampled { raster, array, data } => {
				let Some(ra) = self.rasters.get_mut(&raster) else { return Vec::new() };
				ra.resampler.task_completed(self.compute_pool.as_ref(), &self.reply);
				ra.builder.handle_resampled(array, data)
			}

			Msg::MadeArray { raster, array, data, .. } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.queries_handler.handle_made_array(array, data)),
			Msg::ArrayFailed { raster, array, error, .. } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.queries_handler.handle_array_failed(array, error)),

			Msg::OutputQueueUpdate { raster, query, headroom } => {
				let Some(ra) = self.rasters.get_mut(&raster) else { return Vec::new() };
				let mut out = if let Some(compute) = ra.compute.as_mut() { compute.computation_bedroom.output_queue_update(query, headroom) } else { Vec::new() };
				out.extend(ra.builder_bedroom.output_queue_update(query, headroom));
				out
			}

			Msg::StatusRequest { raster, tile, fingerprint } => {
				if let Some(ra) = self.rasters.get_mut(&raster) {
					if let Some(compute) = ra.compute.as_ref() {
						compute.file_hasher.handle_status_request(self.io_pool.as_ref(), self.reply.clone(), tile, fingerprint);
					}
				}
				Vec::new()
			}
			Msg::Status { raster, tile, status } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.cache_handler.handle_status(tile, status)),

			Msg::ComputeTiles { raster, tiles } => {
				let Some(ra) = self.rasters.get_mut(&raster) else { return Vec::new() };
				let Some(compute) = ra.compute.as_mut() else { return Vec::new() };
				let mut out = Vec::new();
				for (tile, fingerprint, queries) in tiles {
					out.extend(compute.computation_bedroom.schedule_compute_when_needed(tile, fingerprint, queries));
				}
				out
			}
			Msg::ScheduleCompute { raster, tile, fingerprint } => {
				if let Some(ra) = self.rasters.get_mut(&raster) {
					if let Some(compute) = ra.compute.as_ref() {
						compute.computer.handle_schedule_compute(self.compute_pool.as_ref(), self.reply.clone(), tile, fingerprint);
					}
				}
				Vec::new()
			}

			Msg::ComputedPartial { raster, tile, fingerprint, partial, total } => {
				let Some(ra) = self.rasters.get_mut(&raster) else { return Vec::new() };
				let Some(compute) = ra.compute.as_mut() else { return Vec::new() };
				compute.compute_accumulator.computed_partial(tile, fingerprint, partial, total)
			}
			Msg::ComputeFailed { raster, tile, error } => {
				let Some(ra) = self.rasters.get_mut(&raster) else { return Vec::new() };
				if let Some(compute) = ra.compute.as_mut() {
					compute.compute_accumulator.cancel_tile(tile);
				}
				ra.cache_handler.handle_compute_failed(tile, error)
			}

			Msg::MergeTile { raster, tile, fingerprint, partials } => {
				if let Some(ra) = self.rasters.get_mut(&raster) {
					if let Some(compute) = ra.compute.as_ref() {
						compute.merger.handle_merge(self.compute_pool.as_ref(), self.reply.clone(), tile, fingerprint, partials);
					}
				}
				Vec::new()
			}

			Msg::WriteTile { raster, tile, fingerprint, data } => {
				if let Some(ra) = self.rasters.get_mut(&raster) {
					if let Some(compute) = ra.compute.as_ref() {
						compute.writer.handle_write(self.io_pool.as_ref(), self.reply.clone(), tile, fingerprint, data);
					}
				}
				Vec::new()
			}
			Msg::WroteTile { raster, tile } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.cache_handler.handle_wrote_tile(tile)),
			Msg::WroteFailed { raster, tile, error } => self.rasters.get_mut(&raster).map_or_else(Vec::new, |ra| ra.cache_handler.handle_wrote_failed(tile, error)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::Event;
	use crate::metrics::Metrics;
	use crate::pool::InlinePool;
	use crate::types::{ComputedPartial, OrderingPolicy, QuerySpec, RasterSource, UpstreamTile};
	use std::sync::Mutex;
	use tempfile::tempdir;
	use tokio::sync::mpsc::unbounded_channel;

	struct IdentityCompute;
	impl ComputeFn for IdentityCompute {
		fn id(&self) -> &str {
			"identity"
		}
		fn version(&self) -> &str {
			"v1"
		}
		fn upstream_dependencies(&self, _raster: RasterId, _tile: TileIndex) -> Vec<UpstreamTile> {
			Vec::new()
		}
		fn compute(&self, _raster: RasterId, _tile: TileIndex, _upstream: &[Arc<[u8]>]) -> Result<Vec<ComputedPartial>> {
			Ok(vec![ComputedPartial {
				sub_extent: (0, 4),
				data: Arc::from(b"tile".as_slice()),
			}])
		}
	}

	struct ConstantReader(&'static [u8]);
	impl TileReader for ConstantReader {
		fn read_tile(&self, _tile: TileIndex) -> Result<Arc<[u8]>> {
			Ok(Arc::from(self.0))
		}
	}

	struct PassthroughResample;
	impl Resample for PassthroughResample {
		fn resample(&self, tiles: &[(crate::types::TileId, Arc<[u8]>)]) -> Result<Arc<[u8]>> {
			Ok(tiles[0].1.clone())
		}
	}

	fn native_footprint() -> Footprint {
		Footprint::new((0.0, 0.0), (1.0, 1.0), 0.0, 4, 4)
	}

	fn handler() -> RastersHandler {
		let io_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let compute_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let (tx, _rx) = unbounded_channel();
		RastersHandler::new(SchedulerConfig::with_defaults(), EventBus::new(), Arc::new(Metrics::default()), io_pool, compute_pool, tx)
	}

	fn cached_spec(cache_dir: PathBuf) -> RasterSpec {
		RasterSpec {
			channels: ChannelSet::new(vec!["r".into()]),
			tile_width: 4,
			tile_height: 4,
			source: RasterSource::Recipe {
				compute: Arc::new(IdentityCompute),
				cache_dir: Some(cache_dir),
			},
			upstream_rasters: Vec::new(),
			native_footprint: native_footprint(),
		}
	}

	#[test]
	fn register_cached_recipe_succeeds() {
		let dir = tempdir().unwrap();
		let mut h = handler();
		let id = h.register_raster(cached_spec(dir.path().to_path_buf()), Arc::new(PassthroughResample)).unwrap();
		assert!(h.is_registered(id));
	}

	#[test]
	fn register_uncached_recipe_is_rejected_as_a_scope_cut() {
		let mut h = handler();
		let spec = RasterSpec {
			channels: ChannelSet::new(vec!["r".into()]),
			tile_width: 4,
			tile_height: 4,
			source: RasterSource::Recipe {
				compute: Arc::new(IdentityCompute),
				cache_dir: None,
			},
			upstream_rasters: Vec::new(),
			native_footprint: native_footprint(),
		};
		let err = h.register_raster(spec, Arc::new(PassthroughResample)).unwrap_err();
		assert!(err.to_string().contains("cache_dir"));
	}

	#[test]
	fn register_in_memory_source_succeeds() {
		let mut h = handler();
		let spec = RasterSpec {
			channels: ChannelSet::new(vec!["r".into()]),
			tile_width: 4,
			tile_height: 4,
			source: RasterSource::InMemory(Arc::new(ConstantReader(b"pixels"))),
			upstream_rasters: Vec::new(),
			native_footprint: native_footprint(),
		};
		let id = h.register_raster(spec, Arc::new(PassthroughResample)).unwrap();
		assert!(h.is_registered(id));
	}

	#[test]
	fn direct_raster_cannot_be_an_upstream_dependency() {
		let mut h = handler();
		let direct = h
			.register_raster(
				RasterSpec {
					channels: ChannelSet::new(vec!["r".into()]),
					tile_width: 4,
					tile_height: 4,
					source: RasterSource::InMemory(Arc::new(ConstantReader(b"pixels"))),
					upstream_rasters: Vec::new(),
					native_footprint: native_footprint(),
				},
				Arc::new(PassthroughResample),
			)
			.unwrap();

		let dir = tempdir().unwrap();
		let mut dependent = cached_spec(dir.path().to_path_buf());
		dependent.upstream_rasters.push(direct);
		let err = h.register_raster(dependent, Arc::new(PassthroughResample)).unwrap_err();
		assert!(err.to_string().contains("not a registered cache-backed raster"));
	}

	#[test]
	fn post_query_rejects_channel_mismatch() {
		let dir = tempdir().unwrap();
		let mut h = handler();
		let id = h.register_raster(cached_spec(dir.path().to_path_buf()), Arc::new(PassthroughResample)).unwrap();
		let (tx, _rx) = tokio::sync::mpsc::channel(4);
		let spec = QuerySpec {
			raster: id,
			footprint: native_footprint(),
			channels: ChannelSet::new(vec!["nir".into()]),
			ordering: OrderingPolicy::RowMajor,
			queue_capacity: 4,
		};
		let err = h.post_query(id, QueryId(0), spec, tx).unwrap_err();
		assert!(err.to_string().contains("channels"));
	}

	#[test]
	fn post_query_rejects_misaligned_footprint() {
		let dir = tempdir().unwrap();
		let mut h = handler();
		let id = h.register_raster(cached_spec(dir.path().to_path_buf()), Arc::new(PassthroughResample)).unwrap();
		let (tx, _rx) = tokio::sync::mpsc::channel(4);
		let mut misaligned = native_footprint();
		misaligned.pixel_size = (0.3, 0.7);
		let spec = QuerySpec {
			raster: id,
			footprint: misaligned,
			channels: ChannelSet::new(vec!["r".into()]),
			ordering: OrderingPolicy::RowMajor,
			queue_capacity: 4,
		};
		let err = h.post_query(id, QueryId(0), spec, tx).unwrap_err();
		assert!(err.to_string().contains("footprint"));
	}

	#[test]
	fn post_query_accepts_matching_channels_and_footprint() {
		let dir = tempdir().unwrap();
		let mut h = handler();
		let id = h.register_raster(cached_spec(dir.path().to_path_buf()), Arc::new(PassthroughResample)).unwrap();
		let (tx, _rx) = tokio::sync::mpsc::channel(4);
		let spec = QuerySpec {
			raster: id,
			footprint: native_footprint(),
			channels: ChannelSet::new(vec!["r".into()]),
			ordering: OrderingPolicy::RowMajor,
			queue_capacity: 4,
		};
		assert!(h.post_query(id, QueryId(0), spec, tx).is_ok());
	}

	#[test]
	fn close_raster_emits_raster_closed_event() {
		let dir = tempdir().unwrap();
		let events = EventBus::new();
		let seen = Arc::new(Mutex::new(false));
		{
			let seen = seen.clone();
			events.subscribe(move |e| {
				if matches!(e, Event::RasterClosed { .. }) {
					*seen.lock().unwrap() = true;
				}
			});
		}
		let io_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let compute_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let (tx, _rx) = unbounded_channel();
		let mut h = RastersHandler::new(SchedulerConfig::with_defaults(), events, Arc::new(Metrics::default()), io_pool, compute_pool, tx);
		let id = h.register_raster(cached_spec(dir.path().to_path_buf()), Arc::new(PassthroughResample)).unwrap();
		h.close_raster(id);
		assert!(*seen.lock().unwrap());
	}
}
