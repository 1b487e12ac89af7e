//! `Merger` (`spec.md` §4.8): combines a tile's partial compute outputs into
//! one contiguous tile array, as a pool task, then emits `write(tile, array)`.
//!
//! Merging itself is pixel-algorithm territory and out of scope (`spec.md`
//! §1 Non-goals); this crate's merge step does the one thing it *can* do
//! generically — lay partials out at their declared byte offsets — and
//! trusts the compute function's `sub_extent`s to tile the output exactly,
//! per the compute-function contract in `spec.md` §6.

use futures::future::BoxFuture;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::{Msg, PartialMsg};
use crate::pool::WorkerPool;
use crate::types::{Fingerprint, RasterId, TileId};

pub struct Merger {
	raster: RasterId,
}

impl Merger {
	#[must_use]
	pub fn new(raster: RasterId) -> Self {
		Self { raster }
	}

	pub fn handle_merge(&self, pool: &dyn WorkerPool, reply: UnboundedSender<Msg>, tile: TileId, fingerprint: Fingerprint, partials: Vec<PartialMsg>) {
		let raster = self.raster;
		let task: BoxFuture<'static, ()> = Box::pin(async move {
			let merged = tokio::task::spawn_blocking(move || merge_partials(&partials)).await;
			match merged {
				Ok(Ok(bytes)) => {
					let _ = reply.send(Msg::WriteTile {
						raster,
						tile,
						fingerprint,
						data: bytes.into(),
					});
				}
				Ok(Err(e)) => {
					let _ = reply.send(Msg::ComputeFailed { raster, tile, error: e });
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

fn merge_partials(partials: &[PartialMsg]) -> Result<Vec<u8>, String> {
	let mut sorted: Vec<&PartialMsg> = partials.iter().collect();
	sorted.sort_by_key(|p| p.sub_extent.0);

	let mut out = Vec::new();
	for p in sorted {
		if p.sub_extent.0 != out.len() as u64 {
			return Err(format!(
				"gap or overlap in partial coverage: expected offset {}, got {}",
				out.len(),
				p.sub_extent.0
			));
		}
		out.extend_from_slice(&p.data);
	}
	Ok(out)
}
