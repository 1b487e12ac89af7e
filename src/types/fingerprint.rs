//! Fingerprint `H`: the content-addressed validator embedded in every cache
//! tile's on-disk file name (`spec.md` §3, §6).

use sha2::{Digest, Sha256};
use std::fmt;

use super::ids::TileIndex;

/// Current on-disk / wire format version. Bumping this invalidates every
/// previously written tile, per `spec.md` §6 ("library on-disk format
/// version").
pub const FORMAT_VERSION: u32 = 1;

/// A deterministic function of tile spatial extent, channel ordering,
/// compute-function identity + version, upstream tile fingerprints, and the
/// library format version (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
	/// Render as the lowercase hex string embedded in cache file names.
	#[must_use]
	pub fn to_hex(self) -> String {
		let mut s = String::with_capacity(64);
		for b in self.0 {
			s.push_str(&format!("{b:02x}"));
		}
		s
	}

	/// Parse a fingerprint back out of a hex string (as found in a file name).
	#[must_use]
	pub fn from_hex(s: &str) -> Option<Self> {
		if s.len() != 64 {
			return None;
		}
		let mut out = [0u8; 32];
		for (i, byte) in out.iter_mut().enumerate() {
			*byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
		}
		Some(Fingerprint(out))
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

/// Inputs that deterministically derive a tile's fingerprint `H`.
///
/// `upstream` must be canonically ordered (e.g. sorted by raster id) by the
/// caller so that fingerprint derivation itself stays a pure function of its
/// inputs — this mirrors the teacher's `CacheValue` contract of symmetric,
/// order-sensitive (de)serialization in
/// `versatiles_container/src/cache/traits.rs`.
pub struct FingerprintInputs<'a> {
	pub tile_index: TileIndex,
	pub channels: &'a [String],
	pub compute_fn_id: &'a str,
	pub compute_fn_version: &'a str,
	pub upstream: &'a [Fingerprint],
}

/// Compute `H` for a tile from its canonicalized inputs.
#[must_use]
pub fn compute_fingerprint(inputs: &FingerprintInputs<'_>) -> Fingerprint {
	let mut hasher = Sha256::new();
	hasher.update(FORMAT_VERSION.to_le_bytes());
	hasher.update(inputs.tile_index.level.to_le_bytes());
	hasher.update(inputs.tile_index.x.to_le_bytes());
	hasher.update(inputs.tile_index.y.to_le_bytes());
	hasher.update((inputs.channels.len() as u32).to_le_bytes());
	for c in inputs.channels {
		hasher.update((c.len() as u32).to_le_bytes());
		hasher.update(c.as_bytes());
	}
	hasher.update((inputs.compute_fn_id.len() as u32).to_le_bytes());
	hasher.update(inputs.compute_fn_id.as_bytes());
	hasher.update((inputs.compute_fn_version.len() as u32).to_le_bytes());
	hasher.update(inputs.compute_fn_version.as_bytes());
	hasher.update((inputs.upstream.len() as u32).to_le_bytes());
	for fp in inputs.upstream {
		hasher.update(fp.0);
	}
	let digest = hasher.finalize();
	let mut out = [0u8; 32];
	out.copy_from_slice(&digest);
	Fingerprint(out)
}

/// Recompute the checksum over tile bytes, for on-read validation
/// (`spec.md` §6: "optional on-read checksum verification recomputes over
/// the file bytes and compares to `H`"). This is intentionally a distinct
/// function from [`compute_fingerprint`]: the former derives the *expected*
/// identity from the tile's logical inputs, while this one validates the
/// *bytes actually on disk* against that expectation.
#[must_use]
pub fn checksum_bytes(bytes: &[u8]) -> Fingerprint {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	let digest = hasher.finalize();
	let mut out = [0u8; 32];
	out.copy_from_slice(&digest);
	Fingerprint(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn inputs(version: &str) -> FingerprintInputs<'_> {
		FingerprintInputs {
			tile_index: TileIndex::new(4, 1, 2),
			channels: &[],
			compute_fn_id: "demo",
			compute_fn_version: version,
			upstream: &[],
		}
	}

	#[test]
	fn fingerprint_is_deterministic() {
		let a = compute_fingerprint(&inputs("v1"));
		let b = compute_fingerprint(&inputs("v1"));
		assert_eq!(a, b);
	}

	#[test]
	fn fingerprint_changes_with_version() {
		let a = compute_fingerprint(&inputs("v1"));
		let b = compute_fingerprint(&inputs("v2"));
		assert_ne!(a, b);
	}

	#[test]
	fn hex_roundtrip() {
		let fp = compute_fingerprint(&inputs("v1"));
		let hex = fp.to_hex();
		assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
	}

	#[test]
	fn invalid_hex_rejected() {
		assert_eq!(Fingerprint::from_hex("not-hex"), None);
	}
}
