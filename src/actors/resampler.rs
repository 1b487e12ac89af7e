//! `Resampler` (`spec.md` §4.10, §4.11, pooled): remaps sampled tiles onto a
//! query's footprint when it differs from the raster's native tile grid
//! (scale, rotation, origin). The actual resampling kernel is opaque per
//! `spec.md` §1 Non-goals; this crate supplies the pooled dispatch shell and
//! trusts an injected `Resample` function for the pixel math.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::Msg;
use crate::pool::WorkerPool;
use crate::types::{ArrayId, RasterId, TileId};

/// User- or library-supplied resampling kernel: combines sampled tiles onto
/// the query's target grid. Opaque pixel math (`spec.md` §1 Non-goals).
pub trait Resample: Send + Sync {
	fn resample(&self, tiles: &[(TileId, Arc<[u8]>)]) -> Result<Arc<[u8]>>;
}

struct Request {
	array: ArrayId,
	data: Vec<(TileId, Arc<[u8]>)>,
}

pub struct Resampler {
	raster: RasterId,
	kernel: Arc<dyn Resample>,
	concurrency_cap: usize,
	in_flight: usize,
	waiting_room: VecDeque<Request>,
}

impl Resampler {
	#[must_use]
	pub fn new(raster: RasterId, kernel: Arc<dyn Resample>, concurrency_cap: usize) -> Self {
		Self {
			raster,
			kernel,
			concurrency_cap,
			in_flight: 0,
			waiting_room: VecDeque::new(),
		}
	}

	pub fn handle_resample(&mut self, pool: &dyn WorkerPool, reply: UnboundedSender<Msg>, array: ArrayId, data: Vec<(TileId, Arc<[u8]>)>) {
		self.waiting_room.push_back(Request { array, data });
		self.dispatch_ready(pool, &reply);
	}

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
		let kernel = self.kernel.clone();
		let Request { array, data } = req;
		let task: BoxFuture<'static, ()> = Box::pin(async move {
			let result = tokio::task::spawn_blocking(move || kernel.resample(&data)).await;
			match result {
				Ok(Ok(resampled)) => {
					let _ = reply.send(Msg::Resampled { raster, array, data: resampled });
				}
				Ok(Err(e)) => {
					let _ = reply.send(Msg::BuildFailed { raster, array, error: e.to_string() });
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

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pool::InlinePool;
	use crate::types::{QueryId, TileIndex};
	use tokio::sync::mpsc::unbounded_channel;

	struct ConcatKernel;
	impl Resample for ConcatKernel {
		fn resample(&self, tiles: &[(TileId, Arc<[u8]>)]) -> Result<Arc<[u8]>> {
			let mut out = Vec::new();
			for (_, bytes) in tiles {
				out.extend_from_slice(bytes);
			}
			Ok(out.into())
		}
	}

	#[tokio::test]
	async fn resample_invokes_kernel_and_emits_resampled() {
		let mut resampler = Resampler::new(RasterId(0), Arc::new(ConcatKernel), 4);
		let pool = InlinePool::new();
		let (tx, mut rx) = unbounded_channel();
		let array = ArrayId::new(QueryId(1), 0);
		let tile = TileId::new(RasterId(0), TileIndex::new(0, 0, 0));
		resampler.handle_resample(&pool, tx, array, vec![(tile, Arc::from(b"ab".as_slice()))]);
		match rx.recv().await.unwrap() {
			Msg::Resampled { data, .. } => assert_eq!(&*data, b"ab"),
			other => panic!("unexpected message: {other:?}"),
		}
	}
}
