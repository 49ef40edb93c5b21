//! Bearer token issuance and verification.
//!
//! Tokens are HMAC-signed JWTs. Each token names the key that signed it in
//! its `kid` header, so a [`SigningKeyRing`] can hold the current key and any
//! recently retired ones at once: new tokens use the current key, and older
//! tokens keep verifying until they expire or their key is removed from the
//! ring.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::db::models::{Identity, UserRole};
use crate::error::{AuthError, ConfigError};

/// Shortest HMAC key accepted, in bytes.
pub const MIN_KEY_LENGTH: usize = 32;

/// Longest token lifetime accepted: one year.
pub const MAX_TOKEN_DURATION_MINUTES: i64 = 366 * 24 * 60;

const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // User ID
    pub email: String,
    pub role: UserRole,
    pub iat: i64,     // Issued at
    pub nbf: i64,     // Not before
    pub exp: i64,     // Expiration time
}

#[derive(Clone)]
struct SigningKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    fn new(material: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(material),
            decoding: DecodingKey::from_secret(material),
        }
    }
}

/// Immutable set of named HMAC keys.
///
/// Rotation never mutates a ring: [`with_key`](Self::with_key) and
/// [`without_key`](Self::without_key) return a new one.
#[derive(Clone)]
pub struct SigningKeyRing {
    keys: HashMap<String, SigningKey>,
}

impl SigningKeyRing {
    /// Build a ring from `(kid, material)` pairs.
    ///
    /// # Errors
    ///
    /// Fails if the ring would be empty, a kid is blank, or any key is
    /// shorter than [`MIN_KEY_LENGTH`].
    pub fn new<I, K, M>(keys: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, M)>,
        K: Into<String>,
        M: AsRef<[u8]>,
    {
        let mut ring = HashMap::new();
        for (kid, material) in keys {
            let (kid, key) = Self::checked_key(kid.into(), material.as_ref())?;
            ring.insert(kid, key);
        }
        if ring.is_empty() {
            return Err(ConfigError::EmptyKeyRing);
        }
        Ok(Self { keys: ring })
    }

    fn checked_key(kid: String, material: &[u8]) -> Result<(String, SigningKey), ConfigError> {
        if kid.trim().is_empty() {
            return Err(ConfigError::EmptyKeyId);
        }
        if material.len() < MIN_KEY_LENGTH {
            return Err(ConfigError::KeyTooShort {
                kid,
                length: material.len(),
                minimum: MIN_KEY_LENGTH,
            });
        }
        Ok((kid, SigningKey::new(material)))
    }

    /// A copy of this ring with `kid` added (or replaced).
    pub fn with_key(&self, kid: impl Into<String>, material: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
        let (kid, key) = Self::checked_key(kid.into(), material.as_ref())?;
        let mut keys = self.keys.clone();
        keys.insert(kid, key);
        Ok(Self { keys })
    }

    /// A copy of this ring with `kid` retired.
    pub fn without_key(&self, kid: &str) -> Result<Self, ConfigError> {
        let mut keys = self.keys.clone();
        if keys.remove(kid).is_none() {
            return Err(ConfigError::UnknownCurrentKey(kid.to_string()));
        }
        if keys.is_empty() {
            return Err(ConfigError::EmptyKeyRing);
        }
        Ok(Self { keys })
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn get(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.get(kid)
    }
}

impl fmt::Debug for SigningKeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kids: Vec<&str> = self.key_ids().collect();
        kids.sort_unstable();
        f.debug_struct("SigningKeyRing").field("key_ids", &kids).finish()
    }
}

/// Issues and verifies signed, time-bounded identity tokens.
#[derive(Debug, Clone)]
pub struct TokenService {
    ring: Arc<SigningKeyRing>,
    current_kid: String,
    token_duration: Duration,
    algorithm: Algorithm,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    /// # Errors
    ///
    /// Fails if `token_duration` is under one second or over
    /// [`MAX_TOKEN_DURATION_MINUTES`], or `current_kid` is not in `ring`.
    pub fn new(
        ring: SigningKeyRing,
        current_kid: impl Into<String>,
        token_duration: Duration,
    ) -> Result<Self, ConfigError> {
        let current_kid = current_kid.into();
        if token_duration.num_seconds() <= 0 {
            return Err(ConfigError::NonPositiveDuration);
        }
        if token_duration > Duration::minutes(MAX_TOKEN_DURATION_MINUTES)
            || Utc::now().checked_add_signed(token_duration).is_none()
        {
            return Err(ConfigError::DurationTooLong {
                maximum_minutes: MAX_TOKEN_DURATION_MINUTES,
            });
        }
        if !ring.contains(&current_kid) {
            return Err(ConfigError::UnknownCurrentKey(current_kid));
        }
        Ok(Self {
            ring: Arc::new(ring),
            current_kid,
            token_duration,
            algorithm: Algorithm::HS256,
            clock: Arc::new(SystemClock),
        })
    }

    /// Sign new tokens with another member of the HMAC family.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Result<Self, ConfigError> {
        if !HMAC_ALGORITHMS.contains(&algorithm) {
            return Err(ConfigError::UnsupportedAlgorithm(format!("{algorithm:?}")));
        }
        self.algorithm = algorithm;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A new service over `ring`, issuing with `current_kid`.
    ///
    /// Duration, algorithm and clock carry over. The existing service is left
    /// untouched, so callers swap the whole service rather than editing keys
    /// under concurrent readers.
    pub fn rotate(&self, ring: SigningKeyRing, current_kid: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self::new(ring, current_kid, self.token_duration)?
            .with_algorithm(self.algorithm)?
            .with_clock(self.clock.clone()))
    }

    pub fn current_key_id(&self) -> &str {
        &self.current_kid
    }

    pub fn token_duration(&self) -> Duration {
        self.token_duration
    }

    pub fn key_ring(&self) -> &SigningKeyRing {
        &self.ring
    }

    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        if identity.email.trim().is_empty() {
            error!(user_id = %identity.user_id, "refusing to issue token without subject");
            return Err(AuthError::SubjectRequired);
        }

        let now = self.clock.now();
        let expires = now
            .checked_add_signed(self.token_duration)
            .ok_or_else(|| AuthError::SigningFailed("token expiry out of range".into()))?;
        let claims = Claims {
            sub: identity.user_id.to_string(),
            email: identity.email.clone(),
            role: identity.role,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires.timestamp(),
        };

        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.current_kid.clone());

        // current_kid is checked against the ring at construction
        let key = self
            .ring
            .get(&self.current_kid)
            .ok_or_else(|| AuthError::SigningFailed(format!("missing key '{}'", self.current_kid)))?;

        encode(&header, &claims, &key.encoding).map_err(|e| {
            error!(error = %e, kid = %self.current_kid, "failed to sign token");
            AuthError::SigningFailed(e.to_string())
        })
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let result = self.verify_claims(token).and_then(|claims| {
            let user_id = Uuid::parse_str(&claims.sub)
                .map_err(|_| AuthError::MalformedToken("subject is not a user id".into()))?;
            Ok(Identity {
                user_id,
                email: claims.email,
                role: claims.role,
            })
        });

        if let Err(e) = &result {
            warn!(reason = %e, "token rejected");
        }
        result
    }

    fn verify_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token).map_err(|e| match raw_algorithm(token) {
            // an algorithm jsonwebtoken does not even know, `none` included
            Some(alg) if !is_hmac_name(&alg) => AuthError::UnexpectedSigningMethod(alg),
            _ => AuthError::MalformedToken(e.to_string()),
        })?;

        if !HMAC_ALGORITHMS.contains(&header.alg) {
            return Err(AuthError::UnexpectedSigningMethod(format!("{:?}", header.alg)));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::UnknownKeyId(String::new()))?;
        let key = self
            .ring
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;

        // Time bounds are checked below against the injected clock.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let claims = decode::<Claims>(token, &key.decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::InvalidAlgorithm => {
                    AuthError::UnexpectedSigningMethod(format!("{:?}", header.alg))
                }
                _ => AuthError::MalformedToken(e.to_string()),
            })?
            .claims;

        let now = self.clock.now().timestamp();
        if now < claims.nbf {
            return Err(AuthError::TokenNotYetValid);
        }
        if now > claims.exp {
            return Err(AuthError::TokenExpired);
        }

        debug!(kid = %kid, sub = %claims.sub, "token verified");
        Ok(claims)
    }
}

/// The `alg` member of a token header, read without interpreting it.
fn raw_algorithm(token: &str) -> Option<String> {
    let segment = token.split('.').next()?;
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    let header: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    header.get("alg")?.as_str().map(str::to_owned)
}

fn is_hmac_name(alg: &str) -> bool {
    matches!(alg, "HS256" | "HS384" | "HS512")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::DateTime;

    const KEY_A: &[u8] = b"primary-signing-key-0123456789abcdef";
    const KEY_B: &[u8] = b"rotated-signing-key-fedcba9876543210";

    fn identity() -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            email: "test@example.com".to_string(),
            role: UserRole::User,
        }
    }

    fn service_with_clock() -> (TokenService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ring = SigningKeyRing::new([("primary", KEY_A)]).unwrap();
        let service = TokenService::new(ring, "primary", Duration::minutes(15))
            .unwrap()
            .with_clock(clock.clone());
        (service, clock)
    }

    fn tamper_signature(token: &str) -> String {
        let (head, signature) = token.rsplit_once('.').unwrap();
        let mut sig: Vec<char> = signature.chars().collect();
        let mid = sig.len() / 2;
        sig[mid] = if sig[mid] == 'A' { 'B' } else { 'A' };
        format!("{head}.{}", sig.into_iter().collect::<String>())
    }

    #[test]
    fn test_issue_then_verify_echoes_identity() {
        let (service, _) = service_with_clock();
        let who = identity();
        let token = service.issue(&who).unwrap();
        assert_eq!(service.verify(&token).unwrap(), who);
    }

    #[test]
    fn test_token_header_names_current_key() {
        let (service, _) = service_with_clock();
        let token = service.issue(&identity()).unwrap();
        let header = decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("primary"));
        assert_eq!(header.alg, Algorithm::HS256);
    }

    #[test]
    fn test_claim_times_follow_duration() {
        let (service, clock) = service_with_clock();
        let token = service.issue(&identity()).unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        let claims = decode::<Claims>(&token, &DecodingKey::from_secret(KEY_A), &validation)
            .unwrap()
            .claims;
        assert_eq!(claims.iat, clock.now().timestamp());
        assert_eq!(claims.nbf, claims.iat);
        assert_eq!(claims.exp, claims.iat + 15 * 60);
    }

    #[test]
    fn test_blank_subject_rejected() {
        let (service, _) = service_with_clock();
        let mut who = identity();
        who.email = "   ".into();
        assert!(matches!(service.issue(&who), Err(AuthError::SubjectRequired)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let (service, clock) = service_with_clock();
        let token = service.issue(&identity()).unwrap();

        clock.advance(Duration::minutes(15));
        assert!(service.verify(&token).is_ok());

        clock.advance(Duration::seconds(1));
        assert!(matches!(service.verify(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_token_from_the_future_rejected() {
        let (service, clock) = service_with_clock();
        let start = clock.now();
        clock.advance(Duration::minutes(5));
        let token = service.issue(&identity()).unwrap();

        clock.set(start);
        let err = service.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::TokenNotYetValid));
        assert!(err.is_expiry());
    }

    #[test]
    fn test_flipped_signature_rejected() {
        let (service, _) = service_with_clock();
        let token = service.issue(&identity()).unwrap();
        assert!(matches!(
            service.verify(&tamper_signature(&token)),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_same_kid_different_material_rejected() {
        let (service, _) = service_with_clock();
        let forged_ring = SigningKeyRing::new([("primary", KEY_B)]).unwrap();
        let forger = TokenService::new(forged_ring, "primary", Duration::minutes(15)).unwrap();
        let token = forger.issue(&identity()).unwrap();
        assert!(matches!(service.verify(&token), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_unknown_kid_rejected() {
        let (service, _) = service_with_clock();
        let other = TokenService::new(
            SigningKeyRing::new([("stranger", KEY_A)]).unwrap(),
            "stranger",
            Duration::minutes(15),
        )
        .unwrap();
        let token = other.issue(&identity()).unwrap();
        assert!(matches!(
            service.verify(&token),
            Err(AuthError::UnknownKeyId(kid)) if kid == "stranger"
        ));
    }

    #[test]
    fn test_missing_kid_rejected() {
        let (service, _) = service_with_clock();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            email: "test@example.com".into(),
            role: UserRole::User,
            iat: now,
            nbf: now,
            exp: now + 60,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(KEY_A)).unwrap();
        assert!(matches!(service.verify(&token), Err(AuthError::UnknownKeyId(_))));
    }

    #[test]
    fn test_garbage_rejected_as_malformed() {
        let (service, _) = service_with_clock();
        for token in ["", "not-a-token", "a.b.c", "...."] {
            let err = service.verify(token).unwrap_err();
            assert!(matches!(err, AuthError::MalformedToken(_)), "{token:?} gave {err:?}");
        }
    }

    #[test]
    fn test_other_hmac_family_member_accepted() {
        let (service, clock) = service_with_clock();
        let hs512 = service
            .rotate(SigningKeyRing::new([("primary", KEY_A)]).unwrap(), "primary")
            .unwrap()
            .with_algorithm(Algorithm::HS512)
            .unwrap();
        let token = hs512.issue(&identity()).unwrap();
        assert_eq!(decode_header(&token).unwrap().alg, Algorithm::HS512);
        assert!(service.verify(&token).is_ok());
        assert_eq!(hs512.clock.now(), clock.now());
    }

    #[test]
    fn test_rotation_keeps_old_tokens_valid_until_retired() {
        let (old_service, _) = service_with_clock();
        let old_token = old_service.issue(&identity()).unwrap();

        let rotated_ring = old_service.key_ring().with_key("rotated", KEY_B).unwrap();
        let rotated = old_service.rotate(rotated_ring, "rotated").unwrap();
        assert_eq!(rotated.current_key_id(), "rotated");

        let new_token = rotated.issue(&identity()).unwrap();
        assert_eq!(decode_header(&new_token).unwrap().kid.as_deref(), Some("rotated"));
        assert!(rotated.verify(&old_token).is_ok());
        assert!(rotated.verify(&new_token).is_ok());
        // the old service never learned about the new key
        assert!(matches!(old_service.verify(&new_token), Err(AuthError::UnknownKeyId(_))));

        let retired_ring = rotated.key_ring().without_key("primary").unwrap();
        let retired = rotated.rotate(retired_ring, "rotated").unwrap();
        assert!(matches!(retired.verify(&old_token), Err(AuthError::UnknownKeyId(_))));
        assert!(retired.verify(&new_token).is_ok());
    }

    #[test]
    fn test_construction_checks() {
        assert_eq!(
            SigningKeyRing::new([("short", b"too-short".as_slice())]).unwrap_err(),
            ConfigError::KeyTooShort { kid: "short".into(), length: 9, minimum: MIN_KEY_LENGTH }
        );
        assert_eq!(
            SigningKeyRing::new(Vec::<(String, Vec<u8>)>::new()).unwrap_err(),
            ConfigError::EmptyKeyRing
        );
        assert_eq!(SigningKeyRing::new([("", KEY_A)]).unwrap_err(), ConfigError::EmptyKeyId);

        let ring = SigningKeyRing::new([("primary", KEY_A)]).unwrap();
        assert_eq!(
            TokenService::new(ring.clone(), "primary", Duration::zero()).unwrap_err(),
            ConfigError::NonPositiveDuration
        );
        assert_eq!(
            TokenService::new(ring.clone(), "primary", Duration::minutes(-5)).unwrap_err(),
            ConfigError::NonPositiveDuration
        );
        assert_eq!(
            TokenService::new(ring.clone(), "missing", Duration::minutes(5)).unwrap_err(),
            ConfigError::UnknownCurrentKey("missing".into())
        );
        assert!(matches!(
            TokenService::new(ring, "primary", Duration::minutes(5))
                .unwrap()
                .with_algorithm(Algorithm::RS256),
            Err(ConfigError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_unknown_algorithms_are_unexpected_signing_methods() {
        let (service, _) = service_with_clock();
        let token = service.issue(&identity()).unwrap();
        let (_, rest) = token.split_once('.').unwrap();

        for alg in ["none", "None", "XS999", "RS256"] {
            let header = URL_SAFE_NO_PAD.encode(format!(r#"{{"alg":"{alg}","kid":"primary"}}"#));
            let err = service.verify(&format!("{header}.{rest}")).unwrap_err();
            assert!(
                matches!(&err, AuthError::UnexpectedSigningMethod(got) if got == alg),
                "{alg} gave {err:?}"
            );
        }

        // an HMAC name in an otherwise unreadable header is still malformed
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","kid":7}"#);
        let err = service.verify(&format!("{header}.{rest}")).unwrap_err();
        assert!(matches!(err, AuthError::MalformedToken(_)), "{err:?}");
    }

    #[test]
    fn test_overlong_duration_rejected_at_construction() {
        let ring = SigningKeyRing::new([("primary", KEY_A)]).unwrap();
        let expected = ConfigError::DurationTooLong { maximum_minutes: MAX_TOKEN_DURATION_MINUTES };
        assert_eq!(
            TokenService::new(ring.clone(), "primary", Duration::minutes(MAX_TOKEN_DURATION_MINUTES + 1))
                .unwrap_err(),
            expected
        );
        assert_eq!(
            TokenService::new(ring.clone(), "primary", Duration::milliseconds(i64::MAX)).unwrap_err(),
            expected
        );
        assert!(TokenService::new(ring, "primary", Duration::minutes(MAX_TOKEN_DURATION_MINUTES)).is_ok());
    }

    #[test]
    fn test_expiry_overflow_is_an_error_not_a_panic() {
        let (service, clock) = service_with_clock();
        clock.set(DateTime::<Utc>::MAX_UTC - Duration::minutes(1));
        assert!(matches!(service.issue(&identity()), Err(AuthError::SigningFailed(_))));
    }

    #[test]
    fn test_cannot_retire_last_key() {
        let ring = SigningKeyRing::new([("primary", KEY_A)]).unwrap();
        assert_eq!(ring.without_key("primary").unwrap_err(), ConfigError::EmptyKeyRing);
        assert!(ring.without_key("nope").is_err());
    }

    #[test]
    fn test_debug_output_hides_key_material() {
        let ring = SigningKeyRing::new([("primary", KEY_A), ("rotated", KEY_B)]).unwrap();
        let rendered = format!("{ring:?}");
        assert!(rendered.contains("primary") && rendered.contains("rotated"));
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
