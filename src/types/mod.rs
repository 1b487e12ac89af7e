//! Core data types shared across the actor graph: identifiers, footprints,
//! fingerprints, tile/query state.

pub mod fingerprint;
pub mod footprint;
pub mod ids;
pub mod query;
pub mod raster;
pub mod tile;

pub use fingerprint::{compute_fingerprint, checksum_bytes, Fingerprint, FingerprintInputs};
pub use footprint::{ChannelSet, Footprint, OrderingPolicy};
pub use ids::{ArrayId, IdGenerator, QueryId, RasterId, TileId, TileIndex};
pub use query::{ArrayPlan, QueryLifecycle, QuerySpec, QueryState};
pub use raster::{ComputeFn, ComputedPartial, RasterSource, RasterSpec, TileReader, UpstreamTile};
pub use tile::{ArrayState, TileRecord, TileState};
