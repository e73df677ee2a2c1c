//! Long-lived peer identity: seed, Ed25519 key pair, derived IDs.
//!
//! A peer's identity is eternal within a process. Everything here is a pure
//! function of the 32-byte seed:
//!
//! - **FullID**: lowercase hex SHA-1 of the raw 32-byte public key (40 chars).
//! - **ShortID**: first 20 chars of FullID. This is the `peer_id` used on the
//!   tracker dialect, which caps peer ids at 20 bytes.
//! - **InfoHash**: `SHA1(realm || "::" || userKey)`, the namespace under
//!   which peers find each other at a rendezvous. Different realms never
//!   match, even when the user key collides.
//!
//! The hash is pluggable through [`Hasher`] but defaults to SHA-1 everywhere;
//! existing deployments speak SHA-1 on the wire and interop trumps hash
//! hygiene here.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};

use crate::error::{Result, SwitchboardError};

/// Seed length in bytes; Base58-encoded when persisted.
pub const SEED_LEN: usize = 32;

/// Length of a FullID in hex characters.
pub const FULL_ID_LEN: usize = 40;

/// Length of a ShortID in hex characters.
pub const SHORT_ID_LEN: usize = 20;

/// Digest function used for IDs, InfoHashes and SDP binding.
pub trait Hasher: Send + Sync {
    fn digest(&self, data: &[u8]) -> Vec<u8>;
}

/// The default (and wire-compatible) hash.
pub struct Sha1Hasher;

impl Hasher for Sha1Hasher {
    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha1::digest(data).to_vec()
    }
}

/// Lowercase hex SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// FullID for a raw public key, with an explicit hasher.
pub fn make_full_id_with(hasher: &dyn Hasher, public_key: &[u8]) -> String {
    hex::encode(hasher.digest(public_key))
}

/// FullID for a raw public key: lowercase hex SHA-1.
pub fn make_full_id(public_key: &[u8]) -> String {
    make_full_id_with(&Sha1Hasher, public_key)
}

/// ShortID derived from a FullID.
pub fn make_short_id(full_id: &str) -> String {
    full_id.chars().take(SHORT_ID_LEN).collect()
}

/// Symmetric prefix comparison on the shorter of the two ids, tolerating
/// ShortID vs FullID on either side.
pub fn ids_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.starts_with(b) || b.starts_with(a))
}

/// The rendezvous namespace key: `SHA1(realm || "::" || userKey)` as 40-hex.
pub fn info_hash(realm: &str, user_key: &str) -> String {
    info_hash_with(&Sha1Hasher, realm, user_key)
}

/// [`info_hash`] with an explicit hasher.
pub fn info_hash_with(hasher: &dyn Hasher, realm: &str, user_key: &str) -> String {
    let mut material = Vec::with_capacity(realm.len() + 2 + user_key.len());
    material.extend_from_slice(realm.as_bytes());
    material.extend_from_slice(b"::");
    material.extend_from_slice(user_key.as_bytes());
    hex::encode(hasher.digest(&material))
}

/// Re-encode a 40-hex InfoHash as the 20-byte value interpreted as a
/// Latin-1 string, the historical WebTorrent wire form. Each byte maps to
/// the char with the same code point, so JSON escaping round-trips the
/// exact bytes.
pub fn info_hash_wire(info_hash_hex: &str) -> Result<String> {
    let bytes = hex::decode(info_hash_hex)
        .map_err(|e| SwitchboardError::InvalidSeed(format!("bad info hash hex: {e}")))?;
    Ok(bytes.iter().map(|&b| b as char).collect())
}

/// An Ed25519 identity with its derived IDs, built deterministically from a
/// 32-byte seed.
#[derive(Clone)]
pub struct Identity {
    seed: [u8; SEED_LEN],
    signing: SigningKey,
    full_id: String,
    short_id: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the seed.
        f.debug_struct("Identity")
            .field("short_id", &self.short_id)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Derive the identity for a seed. Pure: the same seed always yields the
    /// same key pair and IDs.
    pub fn from_seed(seed: [u8; SEED_LEN]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let full_id = make_full_id(signing.verifying_key().as_bytes());
        let short_id = make_short_id(&full_id);
        Self {
            seed,
            signing,
            full_id,
            short_id,
        }
    }

    /// Restore an identity from a Base58-encoded seed.
    pub fn from_base58(encoded: &str) -> Result<Self> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| SwitchboardError::InvalidSeed(e.to_string()))?;
        let seed: [u8; SEED_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| SwitchboardError::InvalidSeed(format!("{} bytes", v.len())))?;
        Ok(Self::from_seed(seed))
    }

    /// Base58 form of the seed, for persistence by the caller.
    pub fn seed_base58(&self) -> String {
        bs58::encode(self.seed).into_string()
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Raw 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Detached signature over the public key itself: the self-signed
    /// witness the SPS intro packet carries.
    pub fn self_witness(&self) -> Signature {
        let public = self.public_key_bytes();
        self.signing.sign(&public)
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }
}
