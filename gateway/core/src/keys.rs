// Copyright (c) 2024 The Botho Foundation

//! HD key derivation for payment addresses.
//!
//! Every payment session gets its own address at
//! `m/44'/{coin_type}'/0'/0/{index}` below a single BIP-39 master seed.
//! Derivation is pure: given the same seed, coin type and index it always
//! yields the same address and signing key.

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use bip32::{DerivationPath, XPrv};
use bip39::{Language, Mnemonic, Seed};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::MAX_NON_HARDENED_INDEX;

/// Errors from key derivation and signing.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid seed: {0}")]
    InvalidSeed(String),

    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// BIP-39 seed bytes the gateway derives every address from.
pub struct MasterSeed {
    seed: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSeed([REDACTED])")
    }
}

impl MasterSeed {
    /// Build the seed from an English BIP-39 phrase and optional passphrase.
    pub fn from_mnemonic(phrase: &str, passphrase: &str) -> Result<Self, KeyError> {
        let phrase = Zeroizing::new(phrase.split_whitespace().collect::<Vec<_>>().join(" "));
        let mnemonic = Mnemonic::from_phrase(&phrase, Language::English)
            .map_err(|e| KeyError::InvalidSeed(e.to_string()))?;
        let seed = Seed::new(&mnemonic, passphrase);
        Ok(Self {
            seed: Zeroizing::new(seed.as_bytes().to_vec()),
        })
    }

    /// Use raw seed bytes (16 to 64 bytes, per BIP-32).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if !(16..=64).contains(&bytes.len()) {
            return Err(KeyError::InvalidSeed(format!(
                "seed must be 16 to 64 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            seed: Zeroizing::new(bytes.to_vec()),
        })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.seed
    }
}

/// A payment address together with the key that controls it.
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub coin_type: u32,
    pub index: u64,
    /// EIP-55 checksummed address
    pub address: String,
    pub signer: PrivateKeySigner,
}

/// Derives per-session keys from the master seed.
#[derive(Debug)]
pub struct KeyDeriver {
    seed: MasterSeed,
}

impl KeyDeriver {
    pub fn new(seed: MasterSeed) -> Self {
        Self { seed }
    }

    /// Derive the key at `m/44'/{coin_type}'/0'/0/{index}`.
    pub fn derive(&self, coin_type: u32, index: u64) -> Result<DerivedKey, KeyError> {
        self.derive_within(coin_type, index, MAX_NON_HARDENED_INDEX)
    }

    /// Derive a key, rejecting indices above `max_index`.
    pub fn derive_within(
        &self,
        coin_type: u32,
        index: u64,
        max_index: u64,
    ) -> Result<DerivedKey, KeyError> {
        let limit = max_index.min(MAX_NON_HARDENED_INDEX);
        if index > limit {
            return Err(KeyError::InvalidPath(format!(
                "index {} exceeds maximum {}",
                index, limit
            )));
        }
        if coin_type >= 0x8000_0000 {
            return Err(KeyError::InvalidPath(format!(
                "coin type {} is out of range",
                coin_type
            )));
        }

        let path: DerivationPath = derivation_path(coin_type, index)
            .parse()
            .map_err(|e: bip32::Error| KeyError::InvalidPath(e.to_string()))?;
        let xprv = XPrv::derive_from_path(self.seed.as_bytes(), &path)
            .map_err(|e| KeyError::InvalidPath(e.to_string()))?;

        let signer = PrivateKeySigner::from_signing_key(xprv.private_key().clone());

        Ok(DerivedKey {
            coin_type,
            index,
            address: checksum_encode(&signer.address()),
            signer,
        })
    }
}

/// BIP-44 path string for a payment address.
pub fn derivation_path(coin_type: u32, index: u64) -> String {
    format!("m/44'/{}'/0'/0/{}", coin_type, index)
}

/// EIP-55 mixed-case checksum encoding of an address.
pub fn checksum_encode(address: &Address) -> String {
    address.to_checksum(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{keccak256, B256};
    use alloy::signers::SignerSync;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn test_deriver() -> KeyDeriver {
        KeyDeriver::new(MasterSeed::from_mnemonic(TEST_MNEMONIC, "").unwrap())
    }

    #[test]
    fn test_known_eth_address() {
        let key = test_deriver().derive(60, 0).unwrap();
        assert_eq!(
            key.address.to_lowercase(),
            "0x9858effd232b4033e47d90003d41ec34ecaeda94"
        );
        assert_eq!(key.address, "0x9858EfFD232B4033E47d90003D41EC34EcaEda94");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let deriver = test_deriver();
        let a = deriver.derive(60, 42).unwrap();
        let b = deriver.derive(60, 42).unwrap();
        assert_eq!(a.address, b.address);
    }

    #[test]
    fn test_indices_and_coin_types_differ() {
        let deriver = test_deriver();
        let a = deriver.derive(60, 0).unwrap();
        let b = deriver.derive(60, 1).unwrap();
        let c = deriver.derive(966, 0).unwrap();
        assert_ne!(a.address, b.address);
        assert_ne!(a.address, c.address);
    }

    #[test]
    fn test_invalid_mnemonic() {
        let result = MasterSeed::from_mnemonic("abandon abandon abandon", "");
        assert!(matches!(result, Err(KeyError::InvalidSeed(_))));

        // Bad checksum word
        let result = MasterSeed::from_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon",
            "",
        );
        assert!(matches!(result, Err(KeyError::InvalidSeed(_))));
    }

    #[test]
    fn test_passphrase_changes_keys() {
        let plain = test_deriver().derive(60, 0).unwrap();
        let salted = KeyDeriver::new(MasterSeed::from_mnemonic(TEST_MNEMONIC, "TREZOR").unwrap())
            .derive(60, 0)
            .unwrap();
        assert_ne!(plain.address, salted.address);
    }

    #[test]
    fn test_index_bounds() {
        let deriver = test_deriver();
        assert!(deriver.derive(60, MAX_NON_HARDENED_INDEX).is_ok());
        assert!(matches!(
            deriver.derive(60, MAX_NON_HARDENED_INDEX + 1),
            Err(KeyError::InvalidPath(_))
        ));
        assert!(matches!(
            deriver.derive_within(60, 11, 10),
            Err(KeyError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_seed_bytes_length() {
        assert!(MasterSeed::from_bytes(&[7u8; 15]).is_err());
        assert!(MasterSeed::from_bytes(&[7u8; 32]).is_ok());
        assert!(MasterSeed::from_bytes(&[7u8; 65]).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let seed = MasterSeed::from_mnemonic(TEST_MNEMONIC, "").unwrap();
        let debug = format!("{:?}", seed);
        assert!(!debug.contains("abandon"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_signature_recovers_to_address() {
        let key = test_deriver().derive(60, 3).unwrap();
        let hash: B256 = keccak256(b"forward");
        let signature = key.signer.sign_hash_sync(&hash).unwrap();
        let recovered = signature.recover_address_from_prehash(&hash).unwrap();

        assert_eq!(checksum_encode(&recovered), key.address);
    }

    #[test]
    fn test_checksum_encode_vector() {
        // EIP-55 reference vector
        let address: Address = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed".parse().unwrap();
        assert_eq!(
            checksum_encode(&address),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }
}
