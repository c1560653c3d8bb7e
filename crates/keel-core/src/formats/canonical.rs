//! # Canonical Form
//!
//! Bit-exact serialization of an assembled config, for comparing results
//! across processes and runs.
//!
//! The assembled tree contains no clocks, revisions or hash-ordered maps,
//! so equal inputs always produce identical bytes.

use crate::assembler::AssembledConfig;
use crate::types::KeelError;

/// Compact JSON bytes of an assembled config.
pub fn canonical_bytes(config: &AssembledConfig) -> Result<Vec<u8>, KeelError> {
    serde_json::to_vec(config).map_err(|e| KeelError::SerializationError(e.to_string()))
}

/// Fast non-cryptographic fingerprint of an assembled config.
///
/// Rotate-XOR over the canonical bytes. Use `canonical_crypto_hash` when
/// collision resistance matters.
///
/// # Errors
///
/// `SerializationError` when the config cannot be serialized.
pub fn canonical_checksum(config: &AssembledConfig) -> Result<u64, KeelError> {
    Ok(checksum_of(&canonical_bytes(config)?))
}

fn checksum_of(data: &[u8]) -> u64 {
    let mut hash: u64 = data.len() as u64;
    for byte in data {
        hash = hash.rotate_left(7) ^ u64::from(*byte);
    }
    hash
}

/// BLAKE3 hash of the canonical bytes, as 64 hex characters.
///
/// Only available with the `crypto-hash` feature.
///
/// # Errors
///
/// `SerializationError` when the config cannot be serialized.
#[cfg(feature = "crypto-hash")]
pub fn canonical_crypto_hash(config: &AssembledConfig) -> Result<String, KeelError> {
    let data = canonical_bytes(config)?;
    Ok(blake3::hash(&data).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{AssembledGroup, AssembledModule, AssembledOption};
    use crate::types::{ModuleKey, OptionValue};

    fn config(included: bool) -> AssembledConfig {
        AssembledConfig {
            modules: vec![AssembledModule {
                key: ModuleKey::new("video"),
                name: "Video".into(),
                current_state: None,
                metadata: Default::default(),
                groups: vec![AssembledGroup {
                    key: "decoder".into(),
                    name: "Decoder".into(),
                    options: vec![AssembledOption {
                        key: "hdr".into(),
                        name: "HDR".into(),
                        included,
                        value: OptionValue::Bool(included),
                        editable: true,
                        exclude_reason: None,
                        warnings: Vec::new(),
                    }],
                }],
            }],
            violations: Vec::new(),
        }
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = canonical_checksum(&config(true)).expect("checksum");
        assert_eq!(a, canonical_checksum(&config(true)).expect("checksum"));
        assert_ne!(a, canonical_checksum(&config(false)).expect("checksum"));
    }

    #[test]
    fn checksum_covers_canonical_bytes() {
        let bytes = canonical_bytes(&config(true)).expect("bytes");
        assert!(!bytes.is_empty());
        let checksum = canonical_checksum(&config(true)).expect("checksum");
        assert_eq!(checksum, checksum_of(&bytes));
        assert_ne!(checksum, checksum_of(&[]));
    }

    #[test]
    fn bytes_are_identical_for_equal_configs() {
        let a = canonical_bytes(&config(false)).expect("bytes a");
        let b = canonical_bytes(&config(false)).expect("bytes b");
        assert_eq!(a, b);
    }

    #[cfg(feature = "crypto-hash")]
    #[test]
    fn crypto_hash_is_hex_of_canonical_bytes() {
        let hash = canonical_crypto_hash(&config(true)).expect("hash");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, blake3::hash(&[]).to_hex().to_string());
    }
}
