//! `Builder` (`spec.md` §4.10): assembles one production array from cache
//! reads. Tracks in-flight arrays only long enough to remember whether they
//! need resampling, since that decision was made upstream by `Producer` but
//! `Sampled`/`Resampled` replies need it to pick the next hop.

use std::collections::HashMap;

use crate::bus::Msg;
use crate::types::{ArrayId, Fingerprint, RasterId, TileId};

pub struct Builder {
	raster: RasterId,
	needs_resample: HashMap<ArrayId, bool>,
}

impl Builder {
	#[must_use]
	pub fn new(raster: RasterId) -> Self {
		Self {
			raster,
			needs_resample: HashMap::new(),
		}
	}

	/// `build(array, tiles)`: emit `sample(array, tiles)` to Sampler.
	pub fn handle_build(&mut self, array: ArrayId, tiles: Vec<(TileId, Fingerprint)>, needs_resample: bool) -> Vec<Msg> {
		self.needs_resample.insert(array, needs_resample);
		vec![Msg::Sample { raster: self.raster, array, tiles }]
	}

	/// `sampled(array, data)`: resample if the query's footprint isn't
	/// grid-aligned with the raster's tiling; otherwise forward directly.
	pub fn handle_sampled(&mut self, array: ArrayId, data: Vec<(TileId, std::sync::Arc<[u8]>)>) -> Vec<Msg> {
		if self.needs_resample.get(&array).copied().unwrap_or(false) {
			vec![Msg::Resample { raster: self.raster, array, data }]
		} else {
			self.needs_resample.remove(&array);
			let merged = data.into_iter().flat_map(|(_, bytes)| bytes.iter().copied().collect::<Vec<_>>()).collect::<Vec<_>>();
			vec![Msg::Built {
				raster: self.raster,
				array,
				data: merged.into(),
			}]
		}
	}

	/// `resampled(array, data)`: emit `built`.
	pub fn handle_resampled(&mut self, array: ArrayId, data: std::sync::Arc<[u8]>) -> Vec<Msg> {
		self.needs_resample.remove(&array);
		vec![Msg::Built { raster: self.raster, array, data }]
	}

	pub fn kill_array(&mut self, array: ArrayId) {
		self.needs_resample.remove(&array);
	}
}
