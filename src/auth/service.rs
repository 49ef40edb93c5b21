use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::password::{PasswordHasher, MAX_SECRET_BYTES};
use crate::auth::token::TokenService;
use crate::db::models::{Identity, NewUser, User, UserRole};
use crate::db::store::UserStore;
use crate::error::{AppError, AuthError, DatabaseError};

const MIN_PASSWORD_CHARS: usize = 8;

// Only ever compared against, never matched; its job is to cost the same as a real check.
const DUMMY_SECRET: &str = "timing-equaliser-not-a-password";

/// Registration, login and token authentication on top of a [`UserStore`].
pub struct AuthService {
    users: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
    tokens: Arc<TokenService>,
    dummy_hash: String,
}

impl AuthService {
    /// The dummy hash for unknown-account logins is produced here, with the
    /// same hasher and cost as real accounts.
    pub fn new(
        users: Arc<dyn UserStore>,
        hasher: Arc<dyn PasswordHasher>,
        tokens: Arc<TokenService>,
    ) -> Result<Self, AuthError> {
        let dummy_hash = hasher.hash(DUMMY_SECRET)?;
        Ok(Self {
            users,
            hasher,
            tokens,
            dummy_hash,
        })
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Run a hasher call on the blocking pool so a slow bcrypt round does not
    /// stall the other requests sharing this worker.
    async fn with_hasher<T, F>(&self, f: F) -> Result<T, AuthError>
    where
        F: FnOnce(&dyn PasswordHasher) -> Result<T, AuthError> + Send + 'static,
        T: Send + 'static,
    {
        let hasher = Arc::clone(&self.hasher);
        tokio::task::spawn_blocking(move || f(hasher.as_ref()))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))?
    }

    /// Compare against the dummy hash, discarding the outcome.
    async fn spend_comparison(&self, password: &str) {
        let dummy_hash = self.dummy_hash.clone();
        let password = password.to_owned();
        let _ = self
            .with_hasher(move |hasher| hasher.compare(&dummy_hash, &password))
            .await;
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<User, AppError> {
        let email = email.trim();
        validate_email(email)?;
        validate_password(password)?;

        if self.users.find_by_email(email).await?.is_some() {
            return Err(AppError::Conflict("email already exists".into()));
        }

        let secret = password.to_owned();
        let password_hash = self.with_hasher(move |hasher| hasher.hash(&secret)).await?;
        let user = self
            .users
            .create(NewUser {
                email: email.to_string(),
                password_hash,
                role: UserRole::User,
            })
            .await
            .map_err(|e| match e {
                // lost a race with a concurrent registration
                DatabaseError::Duplicate => AppError::Conflict("email already exists".into()),
                other => other.into(),
            })?;

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Returns a fresh token and the account it was issued for.
    ///
    /// An unknown email costs one full hash comparison, same as a wrong
    /// password, and produces the same error.
    pub async fn login(&self, email: &str, password: &str) -> Result<(String, User), AppError> {
        let email = email.trim();

        let user = match self.users.find_by_email(email).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.spend_comparison(password).await;
                warn!("login failed: unknown account");
                return Err(AuthError::InvalidCredential.into());
            }
            Err(e) => {
                self.spend_comparison(password).await;
                return Err(e.into());
            }
        };

        let stored_hash = user.password_hash.clone();
        let secret = password.to_owned();
        if let Err(e) = self
            .with_hasher(move |hasher| hasher.compare(&stored_hash, &secret))
            .await
        {
            warn!(user_id = %user.id, "login failed: credential mismatch");
            return Err(e.into());
        }

        let token = self.tokens.issue(&Identity::from(&user))?;
        info!(user_id = %user.id, "user logged in");
        Ok((token, user))
    }

    /// Verify a bearer token. The identity is the token's own claims; re-read
    /// the store if current account data matters.
    pub fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.verify(token)
    }
}

fn validate_email(email: &str) -> Result<(), AppError> {
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::ValidationError("invalid email format".into()));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_CHARS || password.len() > MAX_SECRET_BYTES {
        return Err(AppError::ValidationError(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters and at most {MAX_SECRET_BYTES} bytes"
        )));
    }
    Ok(())
}
