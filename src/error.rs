use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl From<::config::ConfigError> for AppError {
    fn from(err: ::config::ConfigError) -> Self {
        AppError::ConfigError(ConfigError::Load(err.to_string()))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl AppError {
    /// Machine-readable code and client-safe message.
    ///
    /// Authentication failures collapse into two generic answers so a client
    /// cannot tell a wrong password from an unknown account, or a forged
    /// token from an expired one.
    fn public_parts(&self) -> (&'static str, String) {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredential | AuthError::CredentialTooLong => {
                    ("invalid_credentials", "Invalid email or password".to_string())
                }
                e if e.is_token_rejection() => {
                    ("invalid_token", "Invalid or expired token".to_string())
                }
                _ => ("internal_error", "Internal server error".to_string()),
            },
            AppError::ValidationError(msg) => ("validation_error", msg.clone()),
            AppError::Conflict(msg) => ("conflict", msg.clone()),
            AppError::NotFound(msg) => ("not_found", msg.clone()),
            AppError::RateLimited => ("rate_limited", "Too many requests".to_string()),
            AppError::RequestTimeout => ("request_timeout", "Request timeout".to_string()),
            AppError::DatabaseError(DatabaseError::NotFound) => {
                ("not_found", "Resource not found".to_string())
            }
            _ => ("internal_error", "Internal server error".to_string()),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (code, message) = self.public_parts();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "code": code,
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e.class() {
                ErrorClass::Authentication | ErrorClass::InputRejection => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::RequestTimeout => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Coarse category of a failure, used to decide how it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Raised while building a component; fatal to startup.
    Configuration,
    /// The caller sent something that cannot be processed at all.
    InputRejection,
    /// The caller is not who they claim to be.
    Authentication,
    /// A primitive failed underneath us.
    Internal,
}

/// Per-call failures of the credential core.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Credential exceeds {} bytes", crate::auth::MAX_SECRET_BYTES)]
    CredentialTooLong,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error("Token subject is required")]
    SubjectRequired,

    #[error("Token signing failed: {0}")]
    SigningFailed(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Unexpected signing method: {0}")]
    UnexpectedSigningMethod(String),

    #[error("Unknown key id: {0}")]
    UnknownKeyId(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token not yet valid")]
    TokenNotYetValid,
}

impl AuthError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AuthError::MalformedToken(_) | AuthError::SubjectRequired => ErrorClass::InputRejection,
            AuthError::Hashing(_) | AuthError::SigningFailed(_) => ErrorClass::Internal,
            _ => ErrorClass::Authentication,
        }
    }

    /// True for every reason a presented token is refused.
    pub fn is_token_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::MalformedToken(_)
                | AuthError::UnexpectedSigningMethod(_)
                | AuthError::UnknownKeyId(_)
                | AuthError::InvalidSignature
                | AuthError::TokenExpired
                | AuthError::TokenNotYetValid
        )
    }

    pub fn is_expiry(&self) -> bool {
        matches!(self, AuthError::TokenExpired | AuthError::TokenNotYetValid)
    }
}

/// Construction-time failures. None of these can happen once a component exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Signing key ring is empty")]
    EmptyKeyRing,

    #[error("Signing key id must not be empty")]
    EmptyKeyId,

    #[error("Signing key '{kid}' is {length} bytes, minimum is {minimum}")]
    KeyTooShort {
        kid: String,
        length: usize,
        minimum: usize,
    },

    #[error("Current key id '{0}' is not in the key ring")]
    UnknownCurrentKey(String),

    #[error("Token duration must be positive")]
    NonPositiveDuration,

    #[error("Token duration exceeds {maximum_minutes} minutes")]
    DurationTooLong { maximum_minutes: i64 },

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid bcrypt cost {cost}, must be between {min} and {max}")]
    InvalidCost { cost: u32, min: u32, max: u32 },

    #[error("{0}")]
    Invalid(String),

    #[error("Failed to load settings: {0}")]
    Load(String),
}

impl ConfigError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Record not found")]
    NotFound,

    #[error("Duplicate record")]
    Duplicate,
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => DatabaseError::Duplicate,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}
