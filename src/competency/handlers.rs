use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::handlers::authenticated;
use crate::db::models::Competency;
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCompetencyRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDescriptionRequest {
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompetencyResponse {
    pub id: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Competency> for CompetencyResponse {
    fn from(c: Competency) -> Self {
        Self {
            id: c.id,
            name: c.name,
            description: c.description,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompetenciesResponse {
    pub competencies: Vec<CompetencyResponse>,
    pub count: usize,
}

fn parse_id(raw: &str) -> Result<i32, AppError> {
    raw.parse()
        .map_err(|_| AppError::ValidationError("invalid ID format".into()))
}

pub async fn create(
    req: HttpRequest,
    body: web::Json<CreateCompetencyRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let identity = authenticated(&req, &state)?;
    if body.name.trim().is_empty() {
        return Err(AppError::ValidationError("name is required".into()));
    }

    let competency = state.competencies.create(&body.name, &body.description).await?;
    debug!(user_id = %identity.user_id, competency_id = competency.id, "competency created via api");
    Ok(HttpResponse::Created().json(CompetencyResponse::from(competency)))
}

pub async fn list(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    authenticated(&req, &state)?;

    let competencies: Vec<CompetencyResponse> = state
        .competencies
        .list()
        .await?
        .into_iter()
        .map(CompetencyResponse::from)
        .collect();
    Ok(HttpResponse::Ok().json(CompetenciesResponse {
        count: competencies.len(),
        competencies,
    }))
}

pub async fn get(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    authenticated(&req, &state)?;
    let id = parse_id(&path)?;

    let competency = state.competencies.get(id).await?;
    Ok(HttpResponse::Ok().json(CompetencyResponse::from(competency)))
}

pub async fn update_description(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<UpdateDescriptionRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let identity = authenticated(&req, &state)?;
    let id = parse_id(&path)?;

    let competency = state.competencies.update_description(id, &body.description).await?;
    debug!(user_id = %identity.user_id, competency_id = competency.id, "competency description updated via api");
    Ok(HttpResponse::Ok().json(CompetencyResponse::from(competency)))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/competencies")
            .route("", web::post().to(create))
            .route("", web::get().to(list))
            .route("/{id}", web::get().to(get))
            .route("/{id}/description", web::patch().to(update_description)),
    );
}
