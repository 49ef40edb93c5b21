pub mod auth;
pub mod clock;
pub mod competency;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;
use actix_web::{web, HttpResponse};
use tracing::{info, warn};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use crate::config::Settings;

pub use auth::{AuthService, BcryptHasher, PasswordHasher, RateLimiter, RateLimitConfig, RateLimitPolicy, SigningKeyRing, TokenService};
pub use competency::CompetencyService;
pub use db::{
    Competency, CompetencyStore, Identity, InMemoryCompetencyStore, InMemoryUserStore, PgStore, User,
    UserRole, UserStore,
};

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Mount every route the server exposes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .configure(auth::handlers::routes)
        .configure(competency::handlers::routes);
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth: Arc<AuthService>,
    pub limiter: Arc<RateLimiter>,
    pub competencies: Arc<CompetencyService>,
}

impl AppState {
    /// Validate `config`, connect the stores it names, and build the
    /// services on top.
    pub async fn new(config: Settings) -> Result<Self> {
        config.validate()?;

        if config.database.url.trim().is_empty() {
            warn!("no database configured, data is kept in memory only");
            return Self::in_memory(config);
        }

        let store = PgStore::new_with_options(
            &config.database.url,
            config.database.max_connections,
            Duration::from_secs(5),
        )
        .await?;
        store.migrate().await?;
        let users: Arc<dyn UserStore> = Arc::new(store.clone());
        let competencies: Arc<dyn CompetencyStore> = Arc::new(store);
        Self::with_stores(config, users, competencies)
    }

    /// Services over fresh in-memory stores.
    pub fn in_memory(config: Settings) -> Result<Self> {
        Self::with_stores(
            config,
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemoryCompetencyStore::new()),
        )
    }

    /// Build the services over existing stores.
    pub fn with_stores(
        config: Settings,
        users: Arc<dyn UserStore>,
        competencies: Arc<dyn CompetencyStore>,
    ) -> Result<Self> {
        let hasher = Arc::new(BcryptHasher::new(config.auth.bcrypt_cost)?);
        let ring = SigningKeyRing::new(config.signing_keys())?;
        let tokens = Arc::new(TokenService::new(
            ring,
            config.auth.current_key_id.clone(),
            config.token_duration()?,
        )?);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
        let auth = Arc::new(AuthService::new(users, hasher, tokens)?);

        info!(
            current_key_id = %config.auth.current_key_id,
            keys = config.auth.signing_keys.len(),
            "credential core initialised"
        );

        Ok(Self {
            config: Arc::new(config),
            auth,
            limiter,
            competencies: Arc::new(CompetencyService::new(competencies)),
        })
    }
}
