//! `QueryHandle` (`spec.md` §6): the consumer-facing side of a posted query.
//! Wraps the bounded output queue (`Q`, `spec.md` §3) `Scheduler::post_query`
//! hands back, plus a way to ask the scheduler to cancel it.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::actors::queries_handler::QueryItem;
use crate::scheduler::Command;
use crate::types::{QueryId, RasterId};

/// `query-handle.next() -> sub-array | end | error` (`spec.md` §6).
///
/// Built on `tokio::sync::mpsc` (`SPEC_FULL.md` §10) rather than a
/// hand-rolled blocking queue, matching the teacher's `tokio`-first pipeline
/// style (`versatiles_core/src/types/tile_stream.rs`).
pub struct QueryHandle {
	raster: RasterId,
	query: QueryId,
	receiver: mpsc::Receiver<QueryItem>,
	cmd_tx: mpsc::UnboundedSender<Command>,
}

impl QueryHandle {
	pub(crate) fn new(raster: RasterId, query: QueryId, receiver: mpsc::Receiver<QueryItem>, cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
		Self { raster, query, receiver, cmd_tx }
	}

	#[must_use]
	pub fn raster(&self) -> RasterId {
		self.raster
	}

	#[must_use]
	pub fn query(&self) -> QueryId {
		self.query
	}

	/// Pull the next production array in delivery order. `None` means the
	/// query is done (every array delivered, or it was cancelled/killed).
	pub async fn next(&mut self) -> Option<Result<Arc<[u8]>, String>> {
		let item = self.receiver.recv().await;
		if item.is_some() {
			self.request_retry();
		}
		item
	}

	/// Blocking convenience wrapper over [`QueryHandle::next`] for non-async
	/// callers (`SPEC_FULL.md` §10). Panics if called from inside a `tokio`
	/// runtime thread — same restriction as the underlying `blocking_recv`.
	pub fn next_blocking(&mut self) -> Option<Result<Arc<[u8]>, String>> {
		let item = self.receiver.blocking_recv();
		if item.is_some() {
			self.request_retry();
		}
		item
	}

	/// Tell the scheduler a slot in the output queue just freed up, so a
	/// production array that finished while the channel was full (and so
	/// couldn't advance `delivered_count`, `spec.md` §8 property 2) gets
	/// another delivery attempt. Fire-and-forget, like `cancel()`.
	fn request_retry(&self) {
		let _ = self.cmd_tx.send(Command::RetryDelivery { raster: self.raster, query: self.query });
	}

	/// `query-handle.cancel()` (`spec.md` §6, §4.12). Fire-and-forget: the
	/// scheduler tears down in-flight work for this query on its next tick,
	/// after which `next()` returns `None`.
	pub fn cancel(&self) {
		let _ = self.cmd_tx.send(Command::CancelQuery { raster: self.raster, query: self.query });
	}
}
