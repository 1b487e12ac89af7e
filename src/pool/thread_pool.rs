//! Production [`super::WorkerPool`] backed by a bounded set of `tokio` tasks.
//!
//! Concurrency is capped with a counting semaphore rather than a fixed
//! thread count, the same "N x CPU count" idea as
//! `versatiles_core::ConcurrencyLimits`, but expressed as an async permit so
//! excess submissions queue instead of spawning unbounded OS threads.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

use super::{PoolHandle, WorkerPool};

pub struct ThreadPoolHandle {
	abort: AbortHandle,
}

impl PoolHandle for ThreadPoolHandle {
	fn cancel(&self) {
		self.abort.abort();
	}
}

/// Thread pool adapter. Holds a `tokio::runtime::Handle` so it can be
/// constructed from the scheduler thread and still spawn onto the shared
/// runtime, and a semaphore bounding how many submitted tasks run
/// concurrently.
pub struct ThreadPool {
	handle: Handle,
	permits: Arc<Semaphore>,
}

impl ThreadPool {
	#[must_use]
	pub fn new(handle: Handle, max_concurrency: usize) -> Self {
		Self {
			handle,
			permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
		}
	}
}

impl WorkerPool for ThreadPool {
	fn submit(&self, task: BoxFuture<'static, ()>) -> Box<dyn PoolHandle> {
		let permits = self.permits.clone();
		let join = self.handle.spawn(async move {
			let _permit = permits.acquire().await;
			task.await;
		});
		Box::new(ThreadPoolHandle {
			abort: join.abort_handle(),
		})
	}
}
