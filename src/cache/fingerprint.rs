//! Exact-match keys derived from canonical text and tenant

use crate::cache::types::Fingerprint;
use sha2::{Digest, Sha256};

/// Bytes of the SHA-256 digest kept in a fingerprint (128 bits)
const FINGERPRINT_BYTES: usize = 16;

/// Derives fingerprints. The tenant is always hashed in, length-prefixed, so
/// identical text under different tenants can never share a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintIndex;

impl FingerprintIndex {
    pub fn new() -> Self {
        Self
    }

    pub fn fingerprint(&self, canonical_text: &str, tenant: &str) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update((tenant.len() as u64).to_le_bytes());
        hasher.update(tenant.as_bytes());
        hasher.update(canonical_text.as_bytes());
        let digest = hasher.finalize();

        let hex = digest[..FINGERPRINT_BYTES]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();

        Fingerprint::from_hex(hex)
    }
}
