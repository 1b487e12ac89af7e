//! Content-addressed on-disk tile cache (`spec.md` §3, §6).
//!
//! Grounded on `versatiles_container/src/cache/cache_on_disk.rs`'s
//! file-per-key layout, generalized here with atomic rename-based
//! publication and a self-describing checksum header so corruption is
//! detectable without re-deriving the full fingerprint.

pub mod layout;

pub use layout::{frame_with_checksum, unframe, CacheLayout};
