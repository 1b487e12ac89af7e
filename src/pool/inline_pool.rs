//! Inline [`super::WorkerPool`] for tests: runs the task to completion
//! synchronously on `submit`, the way `spec.md` §6 describes: "inline pool
//! (for tests — runs on submit, completes synchronously)".

use futures::future::BoxFuture;

use super::{PoolHandle, WorkerPool};

pub struct InlinePoolHandle;

impl PoolHandle for InlinePoolHandle {
	fn cancel(&self) {
		// Already ran to completion by the time the caller can get a handle.
	}
}

#[derive(Default)]
pub struct InlinePool;

impl InlinePool {
	#[must_use]
	pub fn new() -> Self {
		Self
	}
}

impl WorkerPool for InlinePool {
	fn submit(&self, task: BoxFuture<'static, ()>) -> Box<dyn PoolHandle> {
		futures::executor::block_on(task);
		Box::new(InlinePoolHandle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::sync::Arc;

	#[test]
	fn task_completes_before_submit_returns() {
		let pool = InlinePool::new();
		let done = Arc::new(AtomicBool::new(false));
		let done2 = done.clone();
		pool.submit(Box::pin(async move {
			done2.store(true, Ordering::SeqCst);
		}));
		assert!(done.load(Ordering::SeqCst));
	}
}
