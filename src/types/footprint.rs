//! Footprint, channel selection and delivery ordering for queries.
//!
//! The actual affine/coordinate math for footprints is out of scope (see
//! `spec.md` §1's scope cut — it is owned by the rest of the library). This
//! module carries just enough structure for the scheduler to decompose a
//! query into production arrays and cache tile dependencies.

use std::collections::HashSet;

/// An affine-mapped integer pixel grid over the plane: origin, pixel vectors
/// and pixel counts (`spec.md` GLOSSARY, "Footprint").
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
	/// Origin of the grid in the raster's plane (arbitrary external CRS units).
	pub origin: (f64, f64),
	/// Pixel size along each axis; non-uniform and non-axis-aligned grids are
	/// expressed by also setting `rotation`.
	pub pixel_size: (f64, f64),
	/// Rotation in radians, applied about `origin`.
    pub rotation: f64,
	/// Grid extent in pixels.
	pub width: u32,
	pub height: u32,
}

impl Footprint {
	#[must_use]
	pub const fn new(origin: (f64, f64), pixel_size: (f64, f64), rotation: f64, width: u32, height: u32) -> Self {
		Self {
			origin,
			pixel_size,
			rotation,
			width,
			height,
		}
	}

	/// Whether this footprint is grid-aligned with `other` (same pixel size,
	/// rotation and origin phase). When true, [`crate::actors::builder::Builder`]
	/// can forward sampled tiles directly instead of routing through the
	/// resampler (`spec.md` §4.10).
	#[must_use]
	pub fn is_aligned_with(&self, other: &Footprint) -> bool {
		const EPS: f64 = 1e-9;
		(self.pixel_size.0 - other.pixel_size.0).abs() < EPS
			&& (self.pixel_size.1 - other.pixel_size.1).abs() < EPS
			&& (self.rotation - other.rotation).abs() < EPS
			&& phase_aligned(self.origin.0, other.origin.0, self.pixel_size.0)
			&& phase_aligned(self.origin.1, other.origin.1, self.pixel_size.1)
	}

	/// Split this footprint into `tile_width` x `tile_height` production-array
	/// footprints, row-major in grid space. The caller (`QueriesHandler`)
	/// subsequently reorders them per the query's [`OrderingPolicy`].
	#[must_use]
	pub fn split_into_tiles(&self, tile_width: u32, tile_height: u32) -> Vec<Footprint> {
		let cols = self.width.div_ceil(tile_width);
		let rows = self.height.div_ceil(tile_height);
		let mut out = Vec::with_capacity((cols * rows) as usize);
		for row in 0..rows {
			for col in 0..cols {
				let w = tile_width.min(self.width - col * tile_width);
				let h = tile_height.min(self.height - row * tile_height);
				let ox = self.origin.0 + f64::from(col * tile_width) * self.pixel_size.0;
				let oy = self.origin.1 + f64::from(row * tile_height) * self.pixel_size.1;
				out.push(Footprint::new((ox, oy), self.pixel_size, self.rotation, w, h));
			}
		}
		out
	}
}

fn phase_aligned(a: f64, b: f64, pixel: f64) -> bool {
	if pixel.abs() < f64::EPSILON {
		return (a - b).abs() < 1e-9;
	}
	let n = (a - b) / pixel;
	(n - n.round()).abs() < 1e-6
}

/// A raster's set of named channels (bands), and a query's requested subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSet(Vec<String>);

impl ChannelSet {
	#[must_use]
	pub fn new(channels: Vec<String>) -> Self {
		Self(channels)
	}

	#[must_use]
	pub fn as_slice(&self) -> &[String] {
		&self.0
	}

	/// `true` if every channel in `subset` is present here.
	#[must_use]
	pub fn contains_all(&self, subset: &ChannelSet) -> bool {
		let have: HashSet<&str> = self.0.iter().map(String::as_str).collect();
		subset.0.iter().all(|c| have.contains(c.as_str()))
	}
}

/// Delivery ordering for a query's production arrays (`spec.md` §3, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingPolicy {
	/// Left-to-right, top-to-bottom.
	RowMajor,
	/// Outward from the footprint's center.
	Spiral,
	/// Whatever order the caller listed production arrays in at post time.
	UserOrder,
}

impl OrderingPolicy {
	/// Reorder `indices` (0..n, as produced by [`Footprint::split_into_tiles`])
	/// into this policy's delivery order.
	#[must_use]
	pub fn order(self, cols: usize, rows: usize, user_order: Option<&[usize]>) -> Vec<usize> {
		let n = cols * rows;
		match self {
			OrderingPolicy::RowMajor => (0..n).collect(),
			OrderingPolicy::Spiral => spiral_order(cols, rows),
			OrderingPolicy::UserOrder => user_order.map(<[usize]>::to_vec).unwrap_or_else(|| (0..n).collect()),
		}
	}
}

fn spiral_order(cols: usize, rows: usize) -> Vec<usize> {
	if cols == 0 || rows == 0 {
		return Vec::new();
	}
	let cx = (cols - 1) as f64 / 2.0;
	let cy = (rows - 1) as f64 / 2.0;
	let mut idx: Vec<usize> = (0..cols * rows).collect();
	idx.sort_by(|&a, &b| {
		let (ax, ay) = ((a % cols) as f64, (a / cols) as f64);
		let (bx, by) = ((b % cols) as f64, (b / cols) as f64);
		let da = (ax - cx).hypot(ay - cy);
		let db = (bx - cx).hypot(by - cy);
		da.partial_cmp(&db).unwrap().then(a.cmp(&b))
	});
	idx
}
