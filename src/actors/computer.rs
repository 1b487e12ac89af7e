//! `Computer` (`spec.md` §4.6): dispatches a scheduled tile computation to
//! the compute pool and forwards each resulting partial to
//! [`super::compute_accumulator::ComputeAccumulator`].
//!
//! Resolving a compute function's declared upstream tiles is a cross-raster
//! concern the per-raster actor can't do alone (it would need another
//! raster's cache), so it goes through an [`UpstreamReader`] the scheduler
//! wires to the raster registry (`spec.md` §6: "forming a DAG resolved by
//! the same scheduler").

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::{Msg, PartialMsg};
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::types::{ComputeFn, Fingerprint, RasterId, TileId, TileIndex};

/// Resolves an upstream raster's tile bytes, blocking the calling thread.
/// Implemented by `RastersHandler` over the set of registered rasters'
/// caches; a separate trait so `Computer` doesn't need a back-reference to
/// the whole scheduler.
pub trait UpstreamReader: Send + Sync {
	fn read_upstream_tile(&self, raster: RasterId, index: TileIndex) -> Result<Arc<[u8]>>;
}

pub struct Computer {
	raster: RasterId,
	compute_fn: Arc<dyn ComputeFn>,
	upstream: Arc<dyn UpstreamReader>,
	metrics: Arc<Metrics>,
}

impl Computer {
	#[must_use]
	pub fn new(raster: RasterId, compute_fn: Arc<dyn ComputeFn>, upstream: Arc<dyn UpstreamReader>, metrics: Arc<Metrics>) -> Self {
		Self { raster, compute_fn, upstream, metrics }
	}

	pub fn handle_schedule_compute(&self, pool: &dyn WorkerPool, reply: UnboundedSender<Msg>, tile: TileId, fingerprint: Fingerprint) {
		let raster = self.raster;
		let compute_fn = self.compute_fn.clone();
		let upstream_reader = self.upstream.clone();
		let metrics = self.metrics.clone();
		let task: BoxFuture<'static, ()> = Box::pin(async move {
			let result = tokio::task::spawn_blocking(move || {
				let deps = compute_fn.upstream_dependencies(raster, tile.index);
				let mut resolved = Vec::with_capacity(deps.len());
				for dep in &deps {
					resolved.push(upstream_reader.read_upstream_tile(dep.raster, dep.index)?);
				}
				compute_fn.compute(raster, tile.index, &resolved)
			})
			.await;

			match result {
				Ok(Ok(partials)) if partials.is_empty() => {
					let _ = reply.send(Msg::ComputeFailed {
						raster,
						tile,
						error: "compute function returned zero partials".to_string(),
					});
				}
				Ok(Ok(partials)) => {
					metrics.record_tile_computed();
					let total = partials.len();
					for p in partials {
						let _ = reply.send(Msg::ComputedPartial {
							raster,
							tile,
							fingerprint,
							partial: PartialMsg {
								sub_extent: p.sub_extent,
								data: p.data,
							},
							total,
						});
					}
				}
				Ok(Err(e)) => {
					let _ = reply.send(Msg::ComputeFailed { raster, tile, error: e.to_string() });
				}
				Err(join_err) => {
					let _ = reply.send(Msg::ComputeFailed {
						raster,
						tile,
						error: join_err.to_string(),
					});
				}
			}
		});
		pool.submit(task);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pool::InlinePool;
	use crate::types::{ComputedPartial, UpstreamTile};
	use tokio::sync::mpsc::unbounded_channel;

	struct NoUpstream;
	impl UpstreamReader for NoUpstream {
		fn read_upstream_tile(&self, _raster: RasterId, _index: TileIndex) -> Result<Arc<[u8]>> {
			anyhow::bail!("no upstream in this test")
		}
	}

	struct ConstantCompute;
	impl ComputeFn for ConstantCompute {
		fn id(&self) -> &str {
			"constant"
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
				data: Arc::from(b"abcd".as_slice()),
			}])
		}
	}

	struct FailingCompute;
	impl ComputeFn for FailingCompute {
		fn id(&self) -> &str {
			"failing"
		}
		fn version(&self) -> &str {
			"v1"
		}
		fn upstream_dependencies(&self, _raster: RasterId, _tile: TileIndex) -> Vec<UpstreamTile> {
			Vec::new()
		}
		fn compute(&self, _raster: RasterId, _tile: TileIndex, _upstream: &[Arc<[u8]>]) -> Result<Vec<ComputedPartial>> {
			anyhow::bail!("boom")
		}
	}

	#[tokio::test]
	async fn successful_compute_emits_computed_partial() {
		let computer = Computer::new(RasterId(0), Arc::new(ConstantCompute), Arc::new(NoUpstream), Arc::new(Metrics::default()));
		let pool = InlinePool::new();
		let (tx, mut rx) = unbounded_channel();
		let tile = TileId::new(RasterId(0), TileIndex::new(0, 0, 0));
		computer.handle_schedule_compute(&pool, tx, tile, Fingerprint([0u8; 32]));
		match rx.recv().await.unwrap() {
			Msg::ComputedPartial { total, .. } => assert_eq!(total, 1),
			other => panic!("unexpected message: {other:?}"),
		}
	}

	#[tokio::test]
	async fn failing_compute_emits_compute_failed() {
		let computer = Computer::new(RasterId(0), Arc::new(FailingCompute), Arc::new(NoUpstream), Arc::new(Metrics::default()));
		let pool = InlinePool::new();
		let (tx, mut rx) = unbounded_channel();
		let tile = TileId::new(RasterId(0), TileIndex::new(0, 0, 0));
		computer.handle_schedule_compute(&pool, tx, tile, Fingerprint([0u8; 32]));
		match rx.recv().await.unwrap() {
			Msg::ComputeFailed { error, .. } => assert!(error.contains("boom")),
			other => panic!("unexpected message: {other:?}"),
		}
	}
}
