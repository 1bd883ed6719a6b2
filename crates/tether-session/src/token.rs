//! Anti-forgery tokens bound to a session id.
//!
//! A token is `base64url(nonce ‖ SHA-256(secret ‖ session_id ‖ nonce))`
//! with no padding. Verification recomputes the digest, so the issuer keeps
//! no per-token state and the raw secret never sits next to a session.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const DIGEST_LEN: usize = 32;
const TOKEN_LEN: usize = NONCE_LEN + DIGEST_LEN;

/// An issued CSRF token (opaque to callers).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CsrfToken(String);

impl CsrfToken {
    /// Borrow the encoded token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CsrfToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CsrfToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CsrfToken(..)")
    }
}

impl AsRef<str> for CsrfToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Mints and verifies [`CsrfToken`]s with a server-held secret.
pub struct TokenIssuer {
    secret: [u8; SECRET_LEN],
}

impl TokenIssuer {
    /// Issuer with a fresh random secret (valid for this process only).
    pub fn random() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);
        Self { secret }
    }

    /// Issuer keyed from configured secret material.
    ///
    /// The material is hashed down to 32 bytes, so any length works; the
    /// settings layer enforces a minimum.
    pub fn from_secret(material: &[u8]) -> Self {
        Self {
            secret: Sha256::digest(material).into(),
        }
    }

    /// Issue a new token for `session_id`.
    pub fn issue(&self, session_id: &str) -> CsrfToken {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let digest = self.digest(session_id, &nonce);
        let mut raw = [0u8; TOKEN_LEN];
        raw[..NONCE_LEN].copy_from_slice(&nonce);
        raw[NONCE_LEN..].copy_from_slice(&digest);
        CsrfToken(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Whether `token` was issued by this issuer for `session_id`.
    pub fn verify(&self, session_id: &str, token: &str) -> bool {
        let Ok(raw) = URL_SAFE_NO_PAD.decode(token.as_bytes()) else {
            return false;
        };
        if raw.len() != TOKEN_LEN {
            return false;
        }
        let (nonce, presented) = raw.split_at(NONCE_LEN);
        let expected = self.digest(session_id, nonce);
        constant_time_eq(&expected, presented)
    }

    fn digest(&self, session_id: &str, nonce: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(session_id.as_bytes());
        hasher.update(nonce);
        hasher.finalize().into()
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer").finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_for_its_session() {
        let issuer = TokenIssuer::random();
        let token = issuer.issue("sess_a");
        assert!(issuer.verify("sess_a", token.as_str()));
    }

    #[test]
    fn token_does_not_verify_for_other_session() {
        let issuer = TokenIssuer::random();
        let token = issuer.issue("sess_a");
        assert!(!issuer.verify("sess_b", token.as_str()));
    }

    #[test]
    fn token_does_not_verify_with_other_secret() {
        let a = TokenIssuer::from_secret(b"first-secret-material");
        let b = TokenIssuer::from_secret(b"second-secret-material");
        let token = a.issue("sess_a");
        assert!(!b.verify("sess_a", token.as_str()));
    }

    #[test]
    fn same_secret_material_is_interchangeable() {
        let a = TokenIssuer::from_secret(b"shared-secret-material");
        let b = TokenIssuer::from_secret(b"shared-secret-material");
        let token = a.issue("sess_a");
        assert!(b.verify("sess_a", token.as_str()));
    }

    #[test]
    fn tokens_are_unique_per_issue() {
        let issuer = TokenIssuer::random();
        assert_ne!(issuer.issue("sess_a"), issuer.issue("sess_a"));
    }

    #[test]
    fn token_is_url_safe_without_padding() {
        let token = TokenIssuer::random().issue("sess_a");
        assert_eq!(token.as_str().len(), 64);
        assert!(
            token
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let issuer = TokenIssuer::random();
        assert!(!issuer.verify("sess_a", ""));
        assert!(!issuer.verify("sess_a", "not base64 !!"));
        assert!(!issuer.verify("sess_a", "c2hvcnQ"));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let issuer = TokenIssuer::random();
        let token = issuer.issue("sess_a");
        let mut raw = URL_SAFE_NO_PAD.decode(token.as_str()).unwrap();
        raw[TOKEN_LEN - 1] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(!issuer.verify("sess_a", &tampered));
    }

    #[test]
    fn debug_does_not_leak_material() {
        let issuer = TokenIssuer::from_secret(b"super-secret-material");
        let token = issuer.issue("sess_a");
        assert!(!format!("{issuer:?}").contains("secret-material"));
        assert_eq!(format!("{token:?}"), "CsrfToken(..)");
    }
}
