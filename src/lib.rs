//! An asynchronous, cache-backed scheduler for lazily-computed geospatial
//! raster tiles.
//!
//! A caller registers one or more rasters (`spec.md` §3's "raster handle":
//! a tiling scheme, a channel set, and either a stored file, an in-memory
//! array, or a recipe computed on demand and cached to disk), then posts
//! queries against them. Each query decomposes into production arrays,
//! delivered in order over a bounded output queue as soon as their
//! dependent cache tiles are valid — computing, merging, writing and
//! resampling them first if they aren't (`spec.md` §2).
//!
//! The scheduler itself is a single-threaded actor graph (`spec.md` §4, §5,
//! §9): one [`actors::rasters_handler::RastersHandler`] dispatches every
//! inter-actor [`bus::Msg`] depth-first, and all blocking work — I/O,
//! compute, merge, resample — runs off that thread on a [`pool::WorkerPool`].
//! See [`scheduler::Scheduler`] for the public entry point.

pub mod actors;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod types;

pub use actors::resampler::Resample;
pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use events::{Event, EventBus, LogLevel};
pub use handle::QueryHandle;
pub use metrics::MetricsSnapshot;
pub use scheduler::Scheduler;
pub use types::{ChannelSet, ComputeFn, ComputedPartial, Footprint, OrderingPolicy, QueryId, QuerySpec, RasterId, RasterSource, RasterSpec, TileReader, UpstreamTile};
