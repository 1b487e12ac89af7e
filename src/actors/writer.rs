//! `Writer` (`spec.md` §4.8, §6): persists a merged tile array atomically via
//! [`CacheLayout::publish`], as a pool task. On success, emits `wrote_tile`.
//! On any I/O error it deletes the temp file (handled internally by
//! `publish`) and emits `wrote_failed`.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::Msg;
use crate::cache::{frame_with_checksum, CacheLayout};
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::types::{Fingerprint, RasterId, TileId, TileState};

pub struct Writer {
	raster: RasterId,
	layout: CacheLayout,
	metrics: Arc<Metrics>,
	events: EventBus,
}

impl Writer {
	#[must_use]
	pub fn new(raster: RasterId, layout: CacheLayout, metrics: Arc<Metrics>, events: EventBus) -> Self {
		Self { raster, layout, metrics, events }
	}

	pub fn handle_write(&self, pool: &dyn WorkerPool, reply: UnboundedSender<Msg>, tile: TileId, fingerprint: Fingerprint, data: Arc<[u8]>) {
		let raster = self.raster;
		let layout = self.layout.clone();
		let metrics = self.metrics.clone();
		let byte_count = data.len() as u64;
		// Same external-only caveat as `ComputeAccumulator`'s `Merging` event:
		// `Writer` never reports back into `CacheHandler`'s `TileRecord`, so
		// this doesn't change the internally-tracked state machine.
		self.events.tile_state_changed(tile, TileState::Writing);
		let task: BoxFuture<'static, ()> = Box::pin(async move {
			let result = tokio::task::spawn_blocking(move || {
				let framed = frame_with_checksum(&data);
				layout.publish(tile.index, fingerprint, &framed)
			})
			.await;
			match result {
				Ok(Ok(_path)) => {
					metrics.record_bytes_written(byte_count);
					let _ = reply.send(Msg::WroteTile { raster, tile });
				}
				Ok(Err(e)) => {
					let _ = reply.send(Msg::WroteFailed { raster, tile, error: e.to_string() });
				}
				Err(join_err) => {
					let _ = reply.send(Msg::WroteFailed {
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
