//! Runner credentials.
//!
//! Runner tokens are never stored in clear: the store keeps a random salt and
//! the hex SHA-256 of `salt + token`, and verification compares digests in
//! constant time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Header carrying the runner's UUID on every authenticated call.
pub const UUID_HEADER: &str = "x-runner-uuid";
/// Header carrying the runner's token on every authenticated call.
pub const TOKEN_HEADER: &str = "x-runner-token";

/// A fresh runner credential: `(token, salt, hash)`.
pub struct Credential {
    pub token: String,
    pub salt: String,
    pub hash: String,
}

impl Credential {
    pub fn generate() -> Self {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let salt = Uuid::new_v4().simple().to_string();
        let hash = hash_token(&token, &salt);
        Self { token, salt, hash }
    }
}

pub fn hash_token(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check `token` against a stored salt and hash.
pub fn verify_token(token: &str, salt: &str, stored_hash: &str) -> bool {
    hash_token(token, salt)
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .into()
}

/// Registration tokens handed to operators.
pub fn new_registration_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_credential_verifies() {
        let cred = Credential::generate();
        assert_eq!(cred.token.len(), 64);
        assert!(verify_token(&cred.token, &cred.salt, &cred.hash));
        assert!(!verify_token("wrong", &cred.salt, &cred.hash));
    }

    #[test]
    fn test_salt_changes_hash() {
        assert_ne!(hash_token("t", "a"), hash_token("t", "b"));
        assert_eq!(hash_token("t", "a"), hash_token("t", "a"));
    }

    #[test]
    fn test_verify_rejects_truncated_hash() {
        let cred = Credential::generate();
        assert!(!verify_token(&cred.token, &cred.salt, &cred.hash[..32]));
        assert!(!verify_token(&cred.token, &cred.salt, ""));
    }
}
