//! PKCE (RFC 7636) primitives for the authorization-code flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// A PKCE verifier and its S256 challenge.
///
/// The verifier is persisted in the PARTIAL session at login and consumed at
/// callback; only the challenge leaves the process.
#[derive(Debug, Clone)]
pub struct CodePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generate a fresh verifier/challenge pair.
///
/// The verifier is 32 random bytes base64url-encoded (43 chars, RFC 7636
/// compliant 43-128 range).
#[must_use]
pub fn generate_code_pair() -> CodePair {
    let random_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(random_bytes);
    let challenge = challenge_for(&verifier);
    CodePair {
        verifier,
        challenge,
    }
}

/// Compute the S256 challenge for a verifier: `BASE64URL(SHA256(verifier))`.
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate a random `state` parameter (16 bytes, base64url).
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}
