//! `Sampler` (`spec.md` §4.11, pooled): reads cache tiles back off disk for
//! one production array. Fronted by a waiting room so requests dispatch to
//! the pool in FIFO order under a per-raster concurrency cap, mirroring
//! `Resampler`'s structure.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::Msg;
use crate::cache::CacheLayout;
use crate::pool::WorkerPool;
use crate::types::{ArrayId, Fingerprint, RasterId, TileId, TileReader};

struct Request {
	array: ArrayId,
	tiles: Vec<(TileId, Fingerprint)>,
}

/// Where `Sampler` reads a tile's bytes from: a cache directory (recipe
/// rasters), or straight through a [`TileReader`] (stored-file/in-memory
/// rasters, which have no cache pipeline to have populated a file for).
#[derive(Clone)]
pub enum TileSource {
	Cached(CacheLayout),
	Direct(Arc<dyn TileReader>),
}

/// Owns the waiting room; dispatch itself is stateless beyond `source`.
pub struct Sampler {
	raster: RasterId,
	source: TileSource,
	concurrency_cap: usize,
	in_flight: usize,
	waiting_room: VecDeque<Request>,
}

impl Sampler {
	#[must_use]
	pub fn new(raster: RasterId, source: TileSource, concurrency_cap: usize) -> Self {
		Self {
			raster,
			source,
			concurrency_cap,
			in_flight: 0,
			waiting_room: VecDeque::new(),
		}
	}

	/// `sample(array, tiles)`: enqueue, then dispatch as many waiting
	/// requests as the concurrency cap currently allows.
	pub fn handle_sample(&mut self, pool: &dyn WorkerPool, reply: UnboundedSender<Msg>, array: ArrayId, tiles: Vec<(TileId, Fingerprint)>) {
		self.waiting_room.push_back(Request { array, tiles });
		self.dispatch_ready(pool, &reply);
	}

	/// A pool task completed (successfully or not); free a concurrency slot
	/// and dispatch the next waiting request, if any.
	pub fn task_completed(&mut self, pool: &dyn WorkerPool, reply: &UnboundedSender<Msg>) {
		self.in_flight = self.in_flight.saturating_sub(1);
		self.dispatch_ready(pool, reply);
	}

	fn dispatch_ready(&mut self, pool: &dyn WorkerPool, reply: &UnboundedSender<Msg>) {
		while self.in_flight < self.concurrency_cap {
			let Some(req) = self.waiting_room.pop_front() else { break };
			self.in_flight += 1;
			self.dispatch_one(pool, reply.clone(), req);
		}
	}

	fn dispatch_one(&self, pool: &dyn WorkerPool, reply: UnboundedSender<Msg>, req: Request) {
		let raster = self.raster;
		let source = self.source.clone();
		let Request { array, tiles } = req;
		let task: BoxFuture<'static, ()> = Box::pin(async move {
			let result = tokio::task::spawn_blocking(move || read_all(&source, &tiles)).await;
			match result {
				Ok(Ok(data)) => {
					let _ = reply.send(Msg::Sampled { raster, array, data });
				}
				Ok(Err(e)) => {
					let _ = reply.send(Msg::BuildFailed { raster, array, error: e });
				}
				Err(join_err) => {
					let _ = reply.send(Msg::BuildFailed {
						raster,
						array,
						error: join_err.to_string(),
					});
				}
			}
		});
		pool.submit(task);
	}
}

fn read_all(source: &TileSource, tiles: &[(TileId, Fingerprint)]) -> Result<Vec<(TileId, std::sync::Arc<[u8]>)>, String> {
	let mut out = Vec::with_capacity(tiles.len());
	for &(tile, fingerprint) in tiles {
		let data = match source {
			TileSource::Cached(layout) => {
				let bytes = layout
					.read(tile.index, fingerprint)
					.map_err(|e| e.to_string())?
					.ok_or_else(|| format!("tile {tile} vanished from cache between VALID and read"))?;
				let payload = crate::cache::unframe(&bytes).ok_or_else(|| format!("tile {tile} file too short to contain checksum header"))?;
				std::sync::Arc::from(payload)
			}
			TileSource::Direct(reader) => reader.read_tile(tile.index).map_err(|e| e.to_string())?,
		};
		out.push((tile, data));
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::frame_with_checksum;
	use crate::pool::InlinePool;
	use crate::types::TileIndex;
	use tempfile::tempdir;
	use tokio::sync::mpsc::unbounded_channel;

	fn fp(seed: u8) -> Fingerprint {
		let mut b = [0u8; 32];
		b[0] = seed;
		Fingerprint(b)
	}

	#[tokio::test]
	async fn sample_reads_back_published_tile() {
		let dir = tempdir().unwrap();
		let layout = CacheLayout::new(dir.path().to_path_buf(), "tile");
		let tile = TileId::new(RasterId(0), TileIndex::new(0, 0, 0));
		let f = fp(1);
		layout.publish(tile.index, f, &frame_with_checksum(b"pixels")).unwrap();

		let mut sampler = Sampler::new(RasterId(0), TileSource::Cached(layout), 4);
		let pool = InlinePool::new();
		let (tx, mut rx) = unbounded_channel();
		let array = ArrayId::new(crate::types::QueryId(1), 0);
		sampler.handle_sample(&pool, tx, array, vec![(tile, f)]);

		match rx.recv().await.unwrap() {
			Msg::Sampled { data, .. } => {
				assert_eq!(data.len(), 1);
				assert_eq!(&*data[0].1, b"pixels");
			}
			other => panic!("unexpected message: {other:?}"),
		}
	}

	#[tokio::test]
	async fn concurrency_cap_queues_excess_requests() {
		let dir = tempdir().unwrap();
		let layout = CacheLayout::new(dir.path().to_path_buf(), "tile");
		let mut sampler = Sampler::new(RasterId(0), TileSource::Cached(layout), 1);
		assert_eq!(sampler.concurrency_cap, 1);
		// InlinePool runs synchronously so in_flight never actually queues in
		// this harness, but the waiting room bookkeeping itself is exercised
		// without panicking for more than `concurrency_cap` pending entries.
		let pool = InlinePool::new();
		let (tx, _rx) = unbounded_channel();
		for i in 0..3u64 {
			let array = ArrayId::new(crate::types::QueryId(1), i as usize);
			sampler.handle_sample(&pool, tx.clone(), array, vec![]);
		}
	}

	struct ConstantTileReader(&'static [u8]);
	impl TileReader for ConstantTileReader {
		fn read_tile(&self, _tile: crate::types::TileIndex) -> anyhow::Result<std::sync::Arc<[u8]>> {
			Ok(std::sync::Arc::from(self.0))
		}
	}

	#[tokio::test]
	async fn direct_source_reads_through_tile_reader() {
		let mut sampler = Sampler::new(RasterId(0), TileSource::Direct(Arc::new(ConstantTileReader(b"direct"))), 4);
		let pool = InlinePool::new();
		let (tx, mut rx) = unbounded_channel();
		let tile = TileId::new(RasterId(0), TileIndex::new(0, 0, 0));
		let array = ArrayId::new(crate::types::QueryId(1), 0);
		sampler.handle_sample(&pool, tx, array, vec![(tile, fp(0))]);

		match rx.recv().await.unwrap() {
			Msg::Sampled { data, .. } => assert_eq!(&*data[0].1, b"direct"),
			other => panic!("unexpected message: {other:?}"),
		}
	}
}
