//! # Formats
//!
//! Serialization formats of the keel CORE.
//!
//! - `snapshot`: JSON bulk load/save of the entity catalog
//! - `canonical`: canonical bytes and fingerprints of assembled configs
//!
//! File I/O operations are in the app layer.

pub mod canonical;
pub mod snapshot;

pub use canonical::{canonical_bytes, canonical_checksum};
#[cfg(feature = "crypto-hash")]
pub use canonical::canonical_crypto_hash;
pub use snapshot::{Snapshot, snapshot_from_json, snapshot_to_json};
