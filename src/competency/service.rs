use std::sync::Arc;
use tracing::info;

use crate::db::models::Competency;
use crate::db::store::CompetencyStore;
use crate::error::{AppError, DatabaseError};

pub const MIN_NAME_BYTES: usize = 2;
pub const MAX_NAME_BYTES: usize = 100;

pub struct CompetencyService {
    store: Arc<dyn CompetencyStore>,
}

impl CompetencyService {
    pub fn new(store: Arc<dyn CompetencyStore>) -> Self {
        Self { store }
    }

    /// Name and description are trimmed; names must be unique.
    pub async fn create(&self, name: &str, description: &str) -> Result<Competency, AppError> {
        let name = name.trim();
        validate_name(name)?;

        if self.store.find_by_name(name).await?.is_some() {
            return Err(AppError::Conflict("competency already exists".into()));
        }

        let competency = self
            .store
            .create(name, description.trim())
            .await
            .map_err(|e| match e {
                DatabaseError::Duplicate => AppError::Conflict("competency already exists".into()),
                other => other.into(),
            })?;

        info!(competency_id = competency.id, name = %competency.name, "competency created");
        Ok(competency)
    }

    pub async fn get(&self, id: i32) -> Result<Competency, AppError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| not_found(id))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Competency, AppError> {
        self.store
            .find_by_name(name.trim())
            .await?
            .ok_or_else(|| AppError::NotFound("competency not found".into()))
    }

    pub async fn list(&self) -> Result<Vec<Competency>, AppError> {
        Ok(self.store.list().await?)
    }

    /// An empty description clears it.
    pub async fn update_description(&self, id: i32, description: &str) -> Result<Competency, AppError> {
        let competency = self
            .store
            .update_description(id, description.trim())
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound => not_found(id),
                other => other.into(),
            })?;

        info!(competency_id = competency.id, "competency description updated");
        Ok(competency)
    }
}

fn not_found(id: i32) -> AppError {
    AppError::NotFound(format!("competency {id} not found"))
}

fn validate_name(name: &str) -> Result<(), AppError> {
    if name.len() < MIN_NAME_BYTES || name.len() > MAX_NAME_BYTES {
        return Err(AppError::ValidationError(format!(
            "competency name must be between {MIN_NAME_BYTES} and {MAX_NAME_BYTES} characters"
        )));
    }
    Ok(())
}
