//! `FileHasher` (`spec.md` §4.5): validates existing cache tiles against
//! their expected fingerprint, off the scheduler thread.

use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::{FileStatus, Msg};
use crate::cache::CacheLayout;
use crate::config::SchedulerConfig;
use crate::pool::WorkerPool;
use crate::types::{Fingerprint, RasterId, TileId};

/// Per-raster file-hashing front end. Holds no state beyond its cache
/// layout and config; every request is dispatched to the I/O pool
/// independently.
pub struct FileHasher {
	raster: RasterId,
	layout: CacheLayout,
	verify_checksum_on_read: bool,
}

impl FileHasher {
	#[must_use]
	pub fn new(raster: RasterId, layout: CacheLayout, config: &SchedulerConfig) -> Self {
		Self {
			raster,
			layout,
			verify_checksum_on_read: config.verify_checksum_on_read,
		}
	}

	/// Handle `StatusRequest`: submit a task to `pool` that checks the file's
	/// existence (and, if configured, its checksum), then sends a `Status`
	/// message back through `reply`.
	pub fn handle_status_request(&self, pool: &dyn WorkerPool, reply: UnboundedSender<Msg>, tile: TileId, fingerprint: Fingerprint) {
		let layout = self.layout.clone();
		let raster = self.raster;
		let verify = self.verify_checksum_on_read;
		let task: BoxFuture<'static, ()> = Box::pin(async move {
			let status = tokio::task::spawn_blocking(move || check_tile(&layout, tile, fingerprint, verify))
				.await
				.unwrap_or(FileStatus::Missing);
			let _ = reply.send(Msg::Status { raster, tile, status });
		});
		pool.submit(task);
	}
}

fn check_tile(layout: &CacheLayout, tile: TileId, fingerprint: Fingerprint, verify: bool) -> FileStatus {
	if !layout.contains(tile.index, fingerprint) {
		return FileStatus::Missing;
	}
	if !verify {
		return FileStatus::Valid;
	}
	match layout.validate(tile.index, fingerprint) {
		Ok(true) => FileStatus::Valid,
		Ok(false) => FileStatus::Corrupt,
		Err(_) => FileStatus::Corrupt,
	}
}
