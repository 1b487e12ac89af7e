//! Worker-pool abstraction (`spec.md` §6, §9 design notes).
//!
//! Actors never block. All blocking work — file hashing, tile computation,
//! merging, writing, sampling, resampling — is handed to a [`WorkerPool`],
//! which executes it off the scheduler thread and delivers the result back
//! as a message the event loop polls once per tick (`spec.md` §5).
//!
//! Grounded on the teacher's parallel-task pattern in
//! `versatiles_core/src/types/tile_stream.rs` (`tokio::spawn` +
//! `buffer_unordered`), generalized here into an explicit submit/cancel
//! interface so the scheduler can track and kill individual tasks.

mod inline_pool;
mod thread_pool;

pub use inline_pool::InlinePool;
pub use thread_pool::ThreadPool;

use futures::future::BoxFuture;

/// A cancellation handle for one submitted task. Cancellation is
/// best-effort (`spec.md` §9 design notes: "pools must surface cancellation
/// on best-effort terms"); the scheduler treats it as a hint and always
/// discards a completion message that arrives after the owning query/tile
/// was killed.
pub trait PoolHandle: Send {
	fn cancel(&self);
}

/// Abstract worker pool: `submit(task) -> future`, `future.cancel()`
/// (`spec.md` §6). `task` is a boxed future that performs its own blocking
/// work (via `spawn_blocking` internally, for CPU/IO-bound closures) and
/// sends its result back to the caller through whatever channel the caller
/// closed over before submitting.
pub trait WorkerPool: Send + Sync {
	fn submit(&self, task: BoxFuture<'static, ()>) -> Box<dyn PoolHandle>;
}
