//! Raster registration: the immutable spec a caller hands to
//! [`crate::scheduler::Scheduler::register_raster`], and the source kinds it
//! may describe (`spec.md` §1, §3, §6).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use super::fingerprint::Fingerprint;
use super::footprint::{ChannelSet, Footprint};
use super::ids::{RasterId, TileIndex};

/// One partial output of a compute function: a sub-extent of the tile plus
/// its data. The union of sub-extents across all partials for a tile must
/// equal the tile (`spec.md` §6, compute-function contract).
#[derive(Debug, Clone)]
pub struct ComputedPartial {
	/// Byte offset range within the tile's canonical row-major layout that
	/// this partial covers. Opaque to the scheduler beyond completeness
	/// bookkeeping (merging itself is the compute function's / `Merger`'s
	/// concern, not this crate's pixel logic).
	pub sub_extent: (u64, u64),
	pub data: Arc<[u8]>,
}

/// A tile's upstream dependency: another raster's tile, whose fingerprint
/// feeds this tile's own fingerprint derivation (`spec.md` §6: "forming a
/// DAG resolved by the same scheduler").
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTile {
	pub raster: RasterId,
	pub index: TileIndex,
}

/// The opaque, user-supplied compute function for a recipe-backed raster.
///
/// The scheduler invokes this once per (tile, missing) pair via the compute
/// worker pool (`spec.md` §4.6); it never inspects pixel content. Because the
/// function may itself emit multiple partials, it returns a `Vec` rather than
/// a single array — the union of `sub_extent`s must cover the whole tile, an
/// invariant this crate trusts the caller to uphold (pixel algorithms are
/// explicitly out of scope, `spec.md` §1 Non-goals).
pub trait ComputeFn: Send + Sync {
	/// Stable identity used in fingerprint derivation. Must not change
	/// without also changing `version()`.
	fn id(&self) -> &str;

	/// Version string; part of fingerprint `H` (`spec.md` §6). Bump this
	/// whenever the function's output for the same inputs would change.
	fn version(&self) -> &str;

	/// Declare which upstream raster tiles this tile depends on, if any.
	fn upstream_dependencies(&self, raster: RasterId, tile: TileIndex) -> Vec<UpstreamTile>;

	/// Compute the tile, given resolved upstream tile bytes in the same order
	/// as `upstream_dependencies` returned them.
	fn compute(&self, raster: RasterId, tile: TileIndex, upstream: &[Arc<[u8]>]) -> Result<Vec<ComputedPartial>>;
}

/// Reads a tile's bytes directly from a raster source that has no cache
/// pipeline of its own (`RasterSource::StoredFile`/`InMemory`). The scheduler
/// invokes this off the scheduler thread, via the I/O pool, the same way
/// `Sampler` reads a cached tile off disk (`spec.md` §4.9).
pub trait TileReader: Send + Sync {
	fn read_tile(&self, tile: TileIndex) -> Result<Arc<[u8]>>;
}

/// Where a raster's bytes come from.
pub enum RasterSource {
	/// A stored file the scheduler reads tiles from directly (no compute
	/// function, no cache — reads go straight to the file via the I/O pool).
	StoredFile { path: PathBuf, reader: Arc<dyn TileReader> },
	/// An in-memory array, already resident; reads go through `reader`
	/// rather than a raw byte slice so multi-tile sources (not just a single
	/// flat buffer) are representable the same way a stored file is.
	InMemory(Arc<dyn TileReader>),
	/// A recipe: pixels are computed on demand, optionally cached to disk.
	Recipe {
		compute: Arc<dyn ComputeFn>,
		cache_dir: Option<PathBuf>,
	},
}

impl std::fmt::Debug for RasterSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RasterSource::StoredFile { path, .. } => f.debug_struct("StoredFile").field("path", path).finish(),
			RasterSource::InMemory(_) => f.debug_tuple("InMemory").finish(),
			RasterSource::Recipe { compute, cache_dir } => f
				.debug_struct("Recipe")
				.field("compute", &compute.id())
				.field("cache_dir", cache_dir)
				.finish(),
		}
	}
}

/// Immutable raster registration spec (`spec.md` §3, "Raster handle").
#[derive(Debug)]
pub struct RasterSpec {
	pub channels: ChannelSet,
	pub tile_width: u32,
	pub tile_height: u32,
	pub source: RasterSource,
	/// Other rasters this one's compute function may read tiles from. Used
	/// for the cycle check at registration time (`SPEC_FULL.md` §11(c)).
	pub upstream_rasters: Vec<RasterId>,
	/// The raster's native tiling grid, positioned in the same plane as
	/// query footprints. `Builder` compares a query's footprint against this
	/// to decide whether resampling is needed (`spec.md` §4.10).
	pub native_footprint: Footprint,
}

impl RasterSpec {
	#[must_use]
	pub fn is_cached(&self) -> bool {
		matches!(&self.source, RasterSource::Recipe { cache_dir: Some(_), .. })
	}

	#[must_use]
	pub fn cache_dir(&self) -> Option<&PathBuf> {
		match &self.source {
			RasterSource::Recipe { cache_dir, .. } => cache_dir.as_ref(),
			_ => None,
		}
	}

	#[must_use]
	pub fn compute_fn(&self) -> Option<&Arc<dyn ComputeFn>> {
		match &self.source {
			RasterSource::Recipe { compute, .. } => Some(compute),
			_ => None,
		}
	}

	/// The direct-read path for `StoredFile`/`InMemory` sources. `None` for
	/// `Recipe` sources, which are read back through the cache instead.
	#[must_use]
	pub fn tile_reader(&self) -> Option<&Arc<dyn TileReader>> {
		match &self.source {
			RasterSource::StoredFile { reader, .. } => Some(reader),
			RasterSource::InMemory(reader) => Some(reader),
			RasterSource::Recipe { .. } => None,
		}
	}
}

/// Tile extent used purely for fingerprinting and file-name derivation; the
/// real spatial extent math lives outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileFingerprintRef {
	pub tile: TileIndex,
	pub fingerprint: Fingerprint,
}
