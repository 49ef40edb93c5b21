use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{Identity, User, UserRole};
use crate::error::{AppError, AuthError};
use crate::AppState;

pub const LOGIN_RESOURCE: &str = "login";
pub const REGISTER_RESOURCE: &str = "register";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub user: UserResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn require_fields(email: &str, password: &str) -> Result<(), AppError> {
    if email.trim().is_empty() {
        return Err(AppError::ValidationError("email is required".into()));
    }
    if password.is_empty() {
        return Err(AppError::ValidationError("password is required".into()));
    }
    Ok(())
}

/// Rate-limit identity for a request: the peer IP.
fn client_identity(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn admit(state: &AppState, req: &HttpRequest, resource: &str) -> Result<(), AppError> {
    let client = client_identity(req);
    if state.limiter.allow(&client, resource) {
        Ok(())
    } else {
        warn!(client = %client, resource, "request rejected by rate limiter");
        Err(AppError::RateLimited)
    }
}

pub async fn login(
    req: HttpRequest,
    body: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    admit(&state, &req, LOGIN_RESOURCE)?;
    require_fields(&body.email, &body.password)?;

    let (token, user) = state.auth.login(&body.email, &body.password).await?;
    Ok(HttpResponse::Ok().json(AuthResponse {
        token: Some(token),
        user: UserResponse::from(&user),
        message: None,
    }))
}

pub async fn register(
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    admit(&state, &req, REGISTER_RESOURCE)?;
    require_fields(&body.email, &body.password)?;

    let user = state.auth.register(&body.email, &body.password).await?;

    // The account exists either way; a failed auto-login only costs the client a token.
    match state.auth.login(&body.email, &body.password).await {
        Ok((token, _)) => Ok(HttpResponse::Created().json(AuthResponse {
            token: Some(token),
            user: UserResponse::from(&user),
            message: None,
        })),
        Err(e) => {
            warn!(user_id = %user.id, error = %e, "registered but auto-login failed");
            Ok(HttpResponse::Created().json(AuthResponse {
                token: None,
                user: UserResponse::from(&user),
                message: Some("Account created successfully. Please try logging in.".into()),
            }))
        }
    }
}

/// The identity behind the request's `Authorization: Bearer` token.
pub fn authenticated(req: &HttpRequest, state: &AppState) -> Result<Identity, AppError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::MalformedToken("no bearer token provided".into()))?;

    Ok(state.auth.authenticate(token)?)
}

/// Echo the identity carried by the caller's bearer token.
pub async fn me(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let identity = authenticated(&req, &state)?;
    info!(user_id = %identity.user_id, "token accepted");
    Ok(HttpResponse::Ok().json(identity))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/auth")
            .route("/register", web::post().to(register))
            .route("/login", web::post().to(login))
            .route("/me", web::get().to(me)),
    );
}
