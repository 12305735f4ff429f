//! Chain keys: seed generation, the one-way ratchet step, TCN derivation

use ito_core::{Tcn, TCN_LENGTH};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::KEY_SIZE;

const STEP_DOMAIN: &[u8] = b"ito-ratchet-step";
const TCN_DOMAIN: &[u8] = b"ito-tcn";

/// A 256-bit hash chain value. Zeroized on drop.
///
/// `chain[0]` is the ratchet seed; every later value is derived with [`advance`].
#[derive(Clone, PartialEq, Eq)]
pub struct ChainKey {
    bytes: [u8; KEY_SIZE],
}

impl ChainKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Sample a fresh ratchet seed from the OS-seeded CSPRNG.
pub fn generate_seed() -> ChainKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ChainKey::from_bytes(bytes)
}

/// One forward step of the hash chain. Preimage resistance of SHA-256 makes
/// this irreversible: `chain[i+1]` reveals nothing about `chain[i]`.
pub fn advance(key: &ChainKey) -> ChainKey {
    let mut hasher = Sha256::new();
    hasher.update(STEP_DOMAIN);
    hasher.update(key.as_bytes());
    ChainKey::from_bytes(hasher.finalize().into())
}

/// Derive the TCN advertised at `tick` from the chain value at that tick.
pub fn derive_tcn(key: &ChainKey, tick: u32) -> Tcn {
    let mut hasher = Sha256::new();
    hasher.update(TCN_DOMAIN);
    hasher.update(tick.to_be_bytes());
    hasher.update(key.as_bytes());
    let mut digest: [u8; KEY_SIZE] = hasher.finalize().into();

    let mut out = [0u8; TCN_LENGTH];
    out.copy_from_slice(&digest[..TCN_LENGTH]);
    digest.zeroize();
    Tcn::from_bytes(out)
}

/// Walk `steps` chain steps forward from `key`.
pub fn advance_by(key: &ChainKey, steps: u32) -> ChainKey {
    let mut current = key.clone();
    for _ in 0..steps {
        current = advance(&current);
    }
    current
}
