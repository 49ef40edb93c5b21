use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::models::{Competency, NewUser, User, UserRow};
use crate::db::store::{CompetencyStore, UserStore};
use crate::error::DatabaseError;

const USER_COLUMNS: &str = "id, email, password_hash, role, created_at, updated_at";
const COMPETENCY_COLUMNS: &str = "id, name, description, created_at, updated_at";

/// Postgres-backed [`UserStore`] and [`CompetencyStore`] over one pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Ok(Self::new(Arc::new(pool)))
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| DatabaseError::MigrationError(e.to_string()))?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn create(&self, user: NewUser) -> Result<User, DatabaseError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (id, email, password_hash, role)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(uuid::Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .fetch_one(self.pool.as_ref())
        .await?;

        User::try_from(row)
    }
}

#[async_trait]
impl CompetencyStore for PgStore {
    async fn create(&self, name: &str, description: &str) -> Result<Competency, DatabaseError> {
        sqlx::query_as::<_, Competency>(&format!(
            r#"
            INSERT INTO competencies (name, description)
            VALUES ($1, $2)
            RETURNING {COMPETENCY_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(description)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| {
            let e = DatabaseError::from(e);
            if matches!(e, DatabaseError::Duplicate) {
                warn!(competency = %name, "duplicate competency name");
            }
            e
        })
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<Competency>, DatabaseError> {
        Ok(sqlx::query_as::<_, Competency>(&format!(
            "SELECT {COMPETENCY_COLUMNS} FROM competencies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Competency>, DatabaseError> {
        Ok(sqlx::query_as::<_, Competency>(&format!(
            "SELECT {COMPETENCY_COLUMNS} FROM competencies WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(self.pool.as_ref())
        .await?)
    }

    async fn list(&self) -> Result<Vec<Competency>, DatabaseError> {
        Ok(sqlx::query_as::<_, Competency>(&format!(
            "SELECT {COMPETENCY_COLUMNS} FROM competencies ORDER BY id"
        ))
        .fetch_all(self.pool.as_ref())
        .await?)
    }

    async fn update_description(&self, id: i32, description: &str) -> Result<Competency, DatabaseError> {
        // RowNotFound converts to DatabaseError::NotFound
        Ok(sqlx::query_as::<_, Competency>(&format!(
            r#"
            UPDATE competencies
            SET description = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {COMPETENCY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(description)
        .fetch_one(self.pool.as_ref())
        .await?)
    }
}
