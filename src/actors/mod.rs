//! The actor graph (`spec.md` §2, §4): one module per component, each owning
//! only its own state and talking to the rest exclusively through
//! [`crate::bus::Msg`]. [`rasters_handler`] is the top-level actor that owns
//! one instance of every other actor per registered raster.

pub mod builder;
pub mod builder_bedroom;
pub mod cache_handler;
pub mod computation_bedroom;
pub mod compute_accumulator;
pub mod computer;
pub mod file_hasher;
pub mod merger;
pub mod producer;
pub mod queries_handler;
pub mod rasters_handler;
pub mod resampler;
pub mod sampler;
pub mod writer;
