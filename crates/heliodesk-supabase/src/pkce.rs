//! PKCE verifier/challenge generation for the authorize redirect.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// PKCE code verifier and challenge
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

/// Generates a PKCE code verifier and its S256 challenge.
pub fn generate_pkce() -> Pkce {
    // Use two UUIDs (16 bytes each) to get 32 random bytes
    let first = uuid::Uuid::new_v4();
    let second = uuid::Uuid::new_v4();
    let mut verifier_bytes = [0u8; 32];
    verifier_bytes[..16].copy_from_slice(first.as_bytes());
    verifier_bytes[16..].copy_from_slice(second.as_bytes());
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = challenge_for(&verifier);

    Pkce {
        verifier,
        challenge,
    }
}

/// S256 challenge for `verifier`.
pub fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
