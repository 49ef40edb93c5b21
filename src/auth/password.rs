use crate::error::{AuthError, ConfigError};
use tracing::error;

/// bcrypt only reads the first 72 bytes of its input and silently drops the rest.
pub const MAX_SECRET_BYTES: usize = 72;

/// One-way password hashing with constant-effort comparison.
pub trait PasswordHasher: Send + Sync {
    /// Hash a plaintext secret for storage.
    fn hash(&self, secret: &str) -> Result<String, AuthError>;

    /// Check `secret` against a stored hash.
    ///
    /// Every reason for a refusal that the caller could act on (wrong secret,
    /// over-long secret) comes back as [`AuthError::InvalidCredential`].
    fn compare(&self, stored_hash: &str, secret: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Clone)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub const MIN_COST: u32 = 4;
    pub const MAX_COST: u32 = 31;

    pub fn new(cost: u32) -> Result<Self, ConfigError> {
        if !(Self::MIN_COST..=Self::MAX_COST).contains(&cost) {
            return Err(ConfigError::InvalidCost {
                cost,
                min: Self::MIN_COST,
                max: Self::MAX_COST,
            });
        }
        Ok(Self { cost })
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self {
            cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash(&self, secret: &str) -> Result<String, AuthError> {
        if secret.len() > MAX_SECRET_BYTES {
            return Err(AuthError::CredentialTooLong);
        }
        bcrypt::hash(secret, self.cost).map_err(|e| {
            error!(error = %e, "failed to hash password");
            AuthError::Hashing(e.to_string())
        })
    }

    fn compare(&self, stored_hash: &str, secret: &str) -> Result<(), AuthError> {
        if secret.len() > MAX_SECRET_BYTES {
            return Err(AuthError::InvalidCredential);
        }
        match bcrypt::verify(secret, stored_hash) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::InvalidCredential),
            Err(e) => {
                error!(error = %e, "failed to compare password hash");
                Err(AuthError::Hashing(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> BcryptHasher {
        BcryptHasher::new(BcryptHasher::MIN_COST).unwrap()
    }

    #[test]
    fn test_hash_then_compare() {
        let hasher = hasher();
        let longest = "x".repeat(MAX_SECRET_BYTES);
        for secret in ["correct horse", "pässwörd-ünïcode", longest.as_str()] {
            let hash = hasher.hash(secret).unwrap();
            assert_ne!(hash, secret);
            assert!(hasher.compare(&hash, secret).is_ok());
        }
    }

    #[test]
    fn test_hashes_are_salted() {
        let hasher = hasher();
        let first = hasher.hash("same secret").unwrap();
        let second = hasher.hash("same secret").unwrap();
        assert_ne!(first, second);
        assert!(hasher.compare(&first, "same secret").is_ok());
        assert!(hasher.compare(&second, "same secret").is_ok());
    }

    #[test]
    fn test_wrong_secret_is_invalid_credential() {
        let hasher = hasher();
        let hash = hasher.hash("password123").unwrap();
        assert!(matches!(
            hasher.compare(&hash, "password124"),
            Err(AuthError::InvalidCredential)
        ));
    }

    #[test]
    fn test_over_long_secret_rejected_before_hashing() {
        let hasher = hasher();
        let long = "a".repeat(MAX_SECRET_BYTES + 1);
        assert!(matches!(hasher.hash(&long), Err(AuthError::CredentialTooLong)));
    }

    #[test]
    fn test_over_long_secret_looks_like_a_mismatch() {
        let hasher = hasher();
        let prefix = "a".repeat(MAX_SECRET_BYTES);
        let hash = hasher.hash(&prefix).unwrap();

        // bcrypt alone would accept this because it only sees the first 72 bytes.
        let extended = format!("{prefix}b");
        let err = hasher.compare(&hash, &extended).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));

        let mismatch = hasher.compare(&hash, "b").unwrap_err();
        assert_eq!(err.class(), mismatch.class());
    }

    #[test]
    fn test_multibyte_length_is_counted_in_bytes() {
        let hasher = hasher();
        // 37 two-byte characters = 74 bytes
        let secret = "é".repeat(37);
        assert!(matches!(hasher.hash(&secret), Err(AuthError::CredentialTooLong)));
    }

    #[test]
    fn test_corrupt_stored_hash_is_internal_error() {
        let hasher = hasher();
        assert!(matches!(
            hasher.compare("not-a-bcrypt-hash", "password123"),
            Err(AuthError::Hashing(_))
        ));
    }

    #[test]
    fn test_cost_bounds_checked_at_construction() {
        assert_eq!(
            BcryptHasher::new(3).unwrap_err(),
            ConfigError::InvalidCost { cost: 3, min: 4, max: 31 }
        );
        assert!(BcryptHasher::new(32).is_err());
        assert!(BcryptHasher::new(4).is_ok());
        assert!(BcryptHasher::new(31).is_ok());
        assert_eq!(BcryptHasher::default().cost(), bcrypt::DEFAULT_COST);
    }

    #[test]
    fn test_hash_embeds_configured_cost() {
        let hash = BcryptHasher::new(5).unwrap().hash("secret").unwrap();
        assert!(hash.starts_with("$2b$05$"), "unexpected hash prefix: {hash}");
    }
}
