//! `Scheduler` (`spec.md` §5, §6): the crate's single entry point. Owns the
//! one-and-only [`RastersHandler`] and the two worker pools, and runs the
//! depth-first event loop (`spec.md` §5: "drain mailbox from pools, dispatch
//! depth-first until empty, repeat") as a dedicated `tokio` task.
//!
//! The public API never touches `RastersHandler` directly — every call
//! crosses into the event-loop task through a [`Command`] and an
//! `oneshot` reply, the same request/response-over-channel shape the
//! teacher's pipeline stages use to hand work across a `tokio::spawn`
//! boundary (`versatiles_core/src/types/tile_stream.rs`). This keeps the
//! actor graph's "no shared mutable state" invariant (`spec.md` §5) intact:
//! `RastersHandler` and everything it owns lives on exactly one task.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::actors::queries_handler::QueryItem;
use crate::actors::rasters_handler::RastersHandler;
use crate::actors::resampler::Resample;
use crate::bus::Msg;
use crate::config::SchedulerConfig;
use crate::events::EventBus;
use crate::handle::QueryHandle;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{ThreadPool, WorkerPool};
use crate::types::{ChannelSet, Footprint, OrderingPolicy, QueryId, QuerySpec, RasterId, RasterSpec};

/// Requests crossing from the public API into the scheduler task.
pub(crate) enum Command {
	RegisterRaster {
		spec: RasterSpec,
		resample_kernel: Arc<dyn Resample>,
		reply: oneshot::Sender<Result<RasterId>>,
	},
	CloseRaster {
		raster: RasterId,
	},
	PostQuery {
		raster: RasterId,
		spec: QuerySpec,
		reply: oneshot::Sender<Result<(QueryId, mpsc::Receiver<QueryItem>)>>,
	},
	CancelQuery {
		raster: RasterId,
		query: QueryId,
	},
	/// Fired by `QueryHandle` after the consumer drains an item, so an array
	/// stuck in `ready_not_delivered` behind an earlier full-channel send
	/// attempt gets retried (`spec.md` §8 property 2).
	RetryDelivery {
		raster: RasterId,
		query: QueryId,
	},
	Stats {
		reply: oneshot::Sender<MetricsSnapshot>,
	},
	Shutdown {
		reply: oneshot::Sender<()>,
	},
}

/// The scheduler handle a caller holds. Cheap to clone — every clone shares
/// the same underlying event-loop task.
#[derive(Clone)]
pub struct Scheduler {
	cmd_tx: mpsc::UnboundedSender<Command>,
	default_queue_capacity: usize,
}

impl Scheduler {
	/// Start a scheduler with CPU-scaled `tokio`-backed worker pools
	/// (`spec.md` §6: "thread pool — N worker threads"). Must be called from
	/// within a `tokio` runtime.
	#[must_use]
	pub fn spawn(config: SchedulerConfig) -> Self {
		Self::spawn_with_events(config, EventBus::new())
	}

	/// As [`Scheduler::spawn`], but lets the caller subscribe to scheduler
	/// lifecycle events before any raster is registered.
	#[must_use]
	pub fn spawn_with_events(config: SchedulerConfig, events: EventBus) -> Self {
		let handle = tokio::runtime::Handle::current();
		let io_pool: Arc<dyn WorkerPool> = Arc::new(ThreadPool::new(handle.clone(), config.io_pool_size));
		let compute_pool: Arc<dyn WorkerPool> = Arc::new(ThreadPool::new(handle, config.compute_pool_size));
		Self::spawn_with_pools(config, events, io_pool, compute_pool)
	}

	/// Start a scheduler over caller-supplied worker pools. The test suite
	/// uses this with [`crate::pool::InlinePool`] for deterministic,
	/// non-threaded runs (`SPEC_FULL.md` §9.4).
	#[must_use]
	pub fn spawn_with_pools(config: SchedulerConfig, events: EventBus, io_pool: Arc<dyn WorkerPool>, compute_pool: Arc<dyn WorkerPool>) -> Self {
		let default_queue_capacity = config.default_queue_capacity;
		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
		let (msg_tx, msg_rx) = mpsc::unbounded_channel();
		let metrics = Arc::new(Metrics::default());
		let rasters = RastersHandler::new(config, events, metrics.clone(), io_pool, compute_pool, msg_tx);
		tokio::spawn(run(rasters, cmd_rx, msg_rx, metrics));
		Self { cmd_tx, default_queue_capacity }
	}

	/// `register_raster(spec) -> raster-id` (`spec.md` §6).
	pub async fn register_raster(&self, spec: RasterSpec, resample_kernel: Arc<dyn Resample>) -> Result<RasterId> {
		let (reply, reply_rx) = oneshot::channel();
		self.cmd_tx
			.send(Command::RegisterRaster { spec, resample_kernel, reply })
			.map_err(|_| anyhow!("scheduler has shut down"))?;
		reply_rx.await.map_err(|_| anyhow!("scheduler dropped the reply"))?
	}

	/// `close_raster(raster-id)` (`spec.md` §6, §4.1).
	pub fn close_raster(&self, raster: RasterId) -> Result<()> {
		self.cmd_tx.send(Command::CloseRaster { raster }).map_err(|_| anyhow!("scheduler has shut down"))
	}

	/// `post_query(raster-id, footprint, channels, ordering, queue-capacity)
	/// -> query-handle` (`spec.md` §6). `queue_capacity` of `0` falls back to
	/// [`SchedulerConfig::default_queue_capacity`].
	pub async fn post_query(&self, raster: RasterId, footprint: Footprint, channels: ChannelSet, ordering: OrderingPolicy, queue_capacity: usize) -> Result<QueryHandle> {
		let queue_capacity = if queue_capacity == 0 { self.default_queue_capacity } else { queue_capacity };
		let spec = QuerySpec {
			raster,
			footprint,
			channels,
			ordering,
			queue_capacity,
		};
		let (reply, reply_rx) = oneshot::channel();
		self.cmd_tx
			.send(Command::PostQuery { raster, spec, reply })
			.map_err(|_| anyhow!("scheduler has shut down"))?;
		let (query, receiver) = reply_rx.await.map_err(|_| anyhow!("scheduler dropped the reply"))??;
		Ok(QueryHandle::new(raster, query, receiver, self.cmd_tx.clone()))
	}

	/// A point-in-time snapshot of the scheduler's metrics counters
	/// (`SPEC_FULL.md` §10).
	pub async fn stats(&self) -> Result<MetricsSnapshot> {
		let (reply, reply_rx) = oneshot::channel();
		self.cmd_tx.send(Command::Stats { reply }).map_err(|_| anyhow!("scheduler has shut down"))?;
		reply_rx.await.map_err(|_| anyhow!("scheduler dropped the reply"))
	}

	/// Close every registered raster and stop the event-loop task
	/// (`SPEC_FULL.md` §10). Idempotent only up to the first call: the
	/// command channel is not reusable afterward.
	pub async fn shutdown(&self) -> Result<()> {
		let (reply, reply_rx) = oneshot::channel();
		self.cmd_tx.send(Command::Shutdown { reply }).map_err(|_| anyhow!("scheduler has shut down"))?;
		reply_rx.await.map_err(|_| anyhow!("scheduler dropped the reply"))
	}
}

/// The event loop (`spec.md` §5): alternate between applying a `Command`
/// from the public API and draining a batch of pool-completion [`Msg`]s,
/// depth-first, until the scheduler is told to shut down.
async fn run(mut rasters: RastersHandler, mut cmd_rx: mpsc::UnboundedReceiver<Command>, mut msg_rx: mpsc::UnboundedReceiver<Msg>, metrics: Arc<Metrics>) {
	loop {
		tokio::select! {
			cmd = cmd_rx.recv() => {
				let Some(cmd) = cmd else { break };
				if apply(&mut rasters, cmd, &metrics) {
					break;
				}
			}
			msg = msg_rx.recv() => {
				let Some(msg) = msg else { break };
				// Drain everything already queued from the pools before
				// going back to the command side: several tile completions
				// often land in the same tick (`spec.md` §5 "tick").
				let mut batch = vec![msg];
				while let Ok(extra) = msg_rx.try_recv() {
					batch.push(extra);
				}
				rasters.drain(batch);
			}
		}
	}
}

/// Apply one [`Command`]. Returns `true` if the event loop should stop.
fn apply(rasters: &mut RastersHandler, cmd: Command, metrics: &Arc<Metrics>) -> bool {
	match cmd {
		Command::RegisterRaster { spec, resample_kernel, reply } => {
			let result = rasters.register_raster(spec, resample_kernel);
			let _ = reply.send(result);
			false
		}
		Command::CloseRaster { raster } => {
			rasters.drain(vec![Msg::KillRaster { raster }]);
			false
		}
		Command::PostQuery { raster, spec, reply } => {
			let query = rasters.next_query_id();
			let (tx, rx) = mpsc::channel(spec.queue_capacity.max(1));
			let result = rasters.post_query(raster, query, spec, tx).map(|seed| {
				rasters.drain(seed);
				(query, rx)
			});
			let _ = reply.send(result);
			false
		}
		Command::CancelQuery { raster, query } => {
			rasters.drain(vec![Msg::CancelQuery { raster, query }]);
			false
		}
		Command::RetryDelivery { raster, query } => {
			rasters.drain(vec![Msg::RetryDelivery { raster, query }]);
			false
		}
		Command::Stats { reply } => {
			let _ = reply.send(metrics.snapshot());
			false
		}
		Command::Shutdown { reply } => {
			for raster in rasters.raster_ids() {
				rasters.drain(vec![Msg::KillRaster { raster }]);
			}
			let _ = reply.send(());
			true
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pool::InlinePool;
	use crate::types::{ComputeFn, ComputedPartial, RasterSource, UpstreamTile};
	use anyhow::Result as AnyResult;
	use std::path::PathBuf;

	struct IdentityCompute;
	impl ComputeFn for IdentityCompute {
		fn id(&self) -> &str {
			"identity"
		}
		fn version(&self) -> &str {
			"v1"
		}
		fn upstream_dependencies(&self, _raster: RasterId, _tile: crate::types::TileIndex) -> Vec<UpstreamTile> {
			Vec::new()
		}
		fn compute(&self, _raster: RasterId, _tile: crate::types::TileIndex, _upstream: &[Arc<[u8]>]) -> AnyResult<Vec<ComputedPartial>> {
			Ok(vec![ComputedPartial {
				sub_extent: (0, 4),
				data: Arc::from(b"tile".as_slice()),
			}])
		}
	}

	struct PassthroughResample;
	impl Resample for PassthroughResample {
		fn resample(&self, tiles: &[(crate::types::TileId, Arc<[u8]>)]) -> AnyResult<Arc<[u8]>> {
			Ok(tiles[0].1.clone())
		}
	}

	fn native_footprint() -> Footprint {
		Footprint::new((0.0, 0.0), (1.0, 1.0), 0.0, 4, 4)
	}

	fn raster_spec(cache_dir: PathBuf) -> RasterSpec {
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

	#[tokio::test]
	async fn register_query_and_deliver_one_array() {
		let dir = tempfile::tempdir().unwrap();
		let io_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let compute_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let scheduler = Scheduler::spawn_with_pools(SchedulerConfig::with_defaults(), EventBus::new(), io_pool, compute_pool);

		let raster = scheduler.register_raster(raster_spec(dir.path().to_path_buf()), Arc::new(PassthroughResample)).await.unwrap();

		let mut handle = scheduler.post_query(raster, native_footprint(), ChannelSet::new(vec!["r".into()]), OrderingPolicy::RowMajor, 4).await.unwrap();

		let item = handle.next().await.unwrap().unwrap();
		assert_eq!(&*item, b"tile");

		let stats = scheduler.stats().await.unwrap();
		assert_eq!(stats.tiles_computed, 1);
		assert_eq!(stats.cache_misses, 1);

		scheduler.shutdown().await.unwrap();
	}

	struct ConstantReader(&'static [u8]);
	impl crate::types::TileReader for ConstantReader {
		fn read_tile(&self, _tile: crate::types::TileIndex) -> AnyResult<Arc<[u8]>> {
			Ok(Arc::from(self.0))
		}
	}

	#[tokio::test]
	async fn registering_an_in_memory_source_succeeds_and_serves_queries() {
		let io_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let compute_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let scheduler = Scheduler::spawn_with_pools(SchedulerConfig::with_defaults(), EventBus::new(), io_pool, compute_pool);

		let spec = RasterSpec {
			channels: ChannelSet::new(vec!["r".into()]),
			tile_width: 4,
			tile_height: 4,
			source: RasterSource::InMemory(Arc::new(ConstantReader(b"direct"))),
			upstream_rasters: Vec::new(),
			native_footprint: native_footprint(),
		};
		let raster = scheduler.register_raster(spec, Arc::new(PassthroughResample)).await.unwrap();

		let mut handle = scheduler.post_query(raster, native_footprint(), ChannelSet::new(vec!["r".into()]), OrderingPolicy::RowMajor, 4).await.unwrap();
		let item = handle.next().await.unwrap().unwrap();
		assert_eq!(&*item, b"direct");

		scheduler.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn registering_an_uncached_recipe_is_rejected() {
		let io_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let compute_pool: Arc<dyn WorkerPool> = Arc::new(InlinePool::new());
		let scheduler = Scheduler::spawn_with_pools(SchedulerConfig::with_defaults(), EventBus::new(), io_pool, compute_pool);

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
		let result = scheduler.register_raster(spec, Arc::new(PassthroughResample)).await;
		assert!(result.is_err());
	}
}
