//! On-disk cache layout and atomic tile publication (`spec.md` §6).
//!
//! File name: `<tile-index>.<H>.<ext>`; temp file:
//! `<tile-index>.<H>.<ext>.tmp.<pid>.<nonce>`. Publication is
//! write-tmp -> fsync-tmp -> rename -> fsync-dir, the same discipline the
//! teacher's `OnDiskCache` almost has (it writes directly to a `.tmp` named
//! file with no rename step); this module adds the rename-based atomicity
//! `spec.md` §4.8/§6 requires, since a single in-place write is not
//! observable-atomic to a concurrent reader.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crate::types::{checksum_bytes, Fingerprint, TileIndex};

static NONCE: AtomicU64 = AtomicU64::new(0);

fn next_nonce() -> u64 {
	NONCE.fetch_add(1, Ordering::Relaxed)
}

/// Owns one raster's cache directory and derives file paths within it.
#[derive(Debug, Clone)]
pub struct CacheLayout {
	dir: PathBuf,
	ext: &'static str,
}

impl CacheLayout {
	#[must_use]
	pub fn new(dir: PathBuf, ext: &'static str) -> Self {
		Self { dir, ext }
	}

	#[must_use]
	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn ensure_dir(&self) -> Result<()> {
		fs::create_dir_all(&self.dir).with_context(|| format!("creating cache directory {}", self.dir.display()))
	}

	/// Canonical on-disk file name for a tile with the given fingerprint.
	#[must_use]
	pub fn entry_path(&self, tile: TileIndex, fingerprint: Fingerprint) -> PathBuf {
		self.dir.join(format!("{}_{}_{}.{}.{}", tile.level, tile.x, tile.y, fingerprint.to_hex(), self.ext))
	}

	fn temp_path(&self, tile: TileIndex, fingerprint: Fingerprint) -> PathBuf {
		let pid = std::process::id();
		let nonce = next_nonce();
		self.dir
			.join(format!("{}_{}_{}.{}.{}.tmp.{}.{}", tile.level, tile.x, tile.y, fingerprint.to_hex(), self.ext, pid, nonce))
	}

	#[must_use]
	pub fn contains(&self, tile: TileIndex, fingerprint: Fingerprint) -> bool {
		self.entry_path(tile, fingerprint).exists()
	}

	/// Atomically publish `bytes` as the canonical entry for `(tile,
	/// fingerprint)`: write to a temp file, fsync it, rename into place,
	/// fsync the directory (`spec.md` §4.8, §6).
	///
	/// If two writers race for the same `(tile, fingerprint)` they produce
	/// identical bytes by construction (fingerprint is a pure function of
	/// logical inputs) and the last rename simply wins harmlessly
	/// (`spec.md` §5).
	pub fn publish(&self, tile: TileIndex, fingerprint: Fingerprint, bytes: &[u8]) -> Result<PathBuf> {
		self.ensure_dir()?;
		let tmp = self.temp_path(tile, fingerprint);
		let result = (|| -> Result<PathBuf> {
			let mut file = File::create(&tmp).with_context(|| format!("creating temp file {}", tmp.display()))?;
			file.write_all(bytes).with_context(|| format!("writing temp file {}", tmp.display()))?;
			file.sync_all().with_context(|| format!("fsyncing temp file {}", tmp.display()))?;
			drop(file);

			let dest = self.entry_path(tile, fingerprint);
			fs::rename(&tmp, &dest).with_context(|| format!("renaming {} to {}", tmp.display(), dest.display()))?;

			if let Ok(dir_file) = File::open(&self.dir) {
				let _ = dir_file.sync_all();
			}
			Ok(dest)
		})();

		if result.is_err() {
			let _ = fs::remove_file(&tmp);
		}
		result
	}

	/// Read the tile's bytes back, if present.
	pub fn read(&self, tile: TileIndex, fingerprint: Fingerprint) -> Result<Option<Vec<u8>>> {
		let path = self.entry_path(tile, fingerprint);
		if !path.exists() {
			return Ok(None);
		}
		let mut file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
		let mut data = Vec::new();
		file.read_to_end(&mut data).with_context(|| format!("reading {}", path.display()))?;
		Ok(Some(data))
	}

	/// Delete the tile's entry, e.g. after a checksum mismatch (`spec.md` §4.4).
	pub fn delete(&self, tile: TileIndex, fingerprint: Fingerprint) -> Result<()> {
		let path = self.entry_path(tile, fingerprint);
		if path.exists() {
			fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
		}
		Ok(())
	}

	/// Validate a tile's bytes against its expected fingerprint, per
	/// `spec.md` §8 property 4: "recomputing `H` over its bytes yields the
	/// same value... OR the file is declared CORRUPT". Returns `Ok(true)`
	/// when valid.
	pub fn validate(&self, tile: TileIndex, fingerprint: Fingerprint) -> Result<bool> {
		let Some(bytes) = self.read(tile, fingerprint)? else {
			bail!("validate called on missing tile entry for {tile}");
		};
		Ok(checksum_over_identity(&bytes, fingerprint))
	}

	/// Recursively delete the whole cache directory.
	pub fn clean_up(&self) -> Result<()> {
		if self.dir.exists() {
			fs::remove_dir_all(&self.dir).with_context(|| format!("removing cache directory {}", self.dir.display()))?;
		}
		Ok(())
	}
}

/// `H` in the file name is itself the validator (`spec.md` §6): this crate's
/// on-read verification recomputes a checksum over the bytes and accepts the
/// tile if that checksum is consistent with a file that really does contain
/// `fingerprint`'s declared bytes. Since pixel encoding is out of scope, we
/// use the byte-identity checksum directly: the file is valid if rehashing
/// its contents reproduces a value that, combined with the file name's `H`,
/// round-trips (i.e. the file has not been truncated/corrupted since write).
/// We store the write-time checksum as a rolling invariant: the first 32
/// bytes of any published tile are its own `checksum_bytes` digest, written
/// by `Writer` before the payload, so corruption of either the header or the
/// payload is detected.
fn checksum_over_identity(bytes: &[u8], _fingerprint: Fingerprint) -> bool {
	if bytes.len() < 32 {
		return false;
	}
	let (header, payload) = bytes.split_at(32);
	let expected = checksum_bytes(payload);
	header == expected.0
}

/// Frame a tile payload with its self-describing checksum header before
/// handing it to [`CacheLayout::publish`]. `Writer` calls this so that
/// [`CacheLayout::validate`] / `FileHasher` can detect corruption without
/// needing to recompute the full fingerprint derivation (which would require
/// re-resolving upstream tiles).
#[must_use]
pub fn frame_with_checksum(payload: &[u8]) -> Vec<u8> {
	let checksum = checksum_bytes(payload);
	let mut out = Vec::with_capacity(32 + payload.len());
	out.extend_from_slice(&checksum.0);
	out.extend_from_slice(payload);
	out
}

/// Strip the checksum header back off, returning the logical payload.
#[must_use]
pub fn unframe(bytes: &[u8]) -> Option<&[u8]> {
	if bytes.len() < 32 {
		return None;
	}
	Some(&bytes[32..])
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn fp(seed: u8) -> Fingerprint {
		let mut b = [0u8; 32];
		b[0] = seed;
		Fingerprint(b)
	}

	#[test]
	fn publish_then_read_roundtrips() {
		let dir = tempdir().unwrap();
		let layout = CacheLayout::new(dir.path().to_path_buf(), "tile");
		let tile = TileIndex::new(3, 1, 2);
		let f = fp(1);
		let framed = frame_with_checksum(b"hello tile");
		layout.publish(tile, f, &framed).unwrap();

		assert!(layout.contains(tile, f));
		let read_back = layout.read(tile, f).unwrap().unwrap();
		assert_eq!(unframe(&read_back).unwrap(), b"hello tile");
	}

	#[test]
	fn publish_leaves_no_temp_files_on_success() {
		let dir = tempdir().unwrap();
		let layout = CacheLayout::new(dir.path().to_path_buf(), "tile");
		let tile = TileIndex::new(0, 0, 0);
		layout.publish(tile, fp(2), &frame_with_checksum(b"x")).unwrap();

		let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
		assert_eq!(entries.len(), 1);
		let name = entries[0].as_ref().unwrap().file_name();
		assert!(!name.to_string_lossy().contains(".tmp."));
	}

	#[test]
	fn validate_detects_truncation() {
		let dir = tempdir().unwrap();
		let layout = CacheLayout::new(dir.path().to_path_buf(), "tile");
		let tile = TileIndex::new(0, 0, 0);
		let f = fp(3);
		layout.publish(tile, f, &frame_with_checksum(b"0123456789")).unwrap();
		assert!(layout.validate(tile, f).unwrap());

		// truncate by 1 byte, as scenario S3 in spec.md §8 does
		let path = layout.entry_path(tile, f);
		let mut data = fs::read(&path).unwrap();
		data.pop();
		fs::write(&path, data).unwrap();

		assert!(!layout.validate(tile, f).unwrap());
	}

	#[test]
	fn delete_then_missing() {
		let dir = tempdir().unwrap();
		let layout = CacheLayout::new(dir.path().to_path_buf(), "tile");
		let tile = TileIndex::new(0, 0, 0);
		let f = fp(4);
		layout.publish(tile, f, &frame_with_checksum(b"x")).unwrap();
		layout.delete(tile, f).unwrap();
		assert!(!layout.contains(tile, f));
	}

	#[test]
	fn concurrent_same_fingerprint_writers_converge() {
		let dir = tempdir().unwrap();
		let layout = CacheLayout::new(dir.path().to_path_buf(), "tile");
		let tile = TileIndex::new(0, 0, 0);
		let f = fp(5);
		// two writers racing for the same fingerprint produce identical bytes;
		// both publishes must succeed and the final content is byte-identical.
		layout.publish(tile, f, &frame_with_checksum(b"same")).unwrap();
		layout.publish(tile, f, &frame_with_checksum(b"same")).unwrap();
		assert_eq!(unframe(&layout.read(tile, f).unwrap().unwrap()).unwrap(), b"same");
	}
}
