use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::db::models::{Competency, NewUser, User};
use crate::error::DatabaseError;

/// Account lookup and creation, keyed by email.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns `Ok(None)` when no account uses this email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError>;

    /// Fails with [`DatabaseError::Duplicate`] when the email is taken.
    async fn create(&self, user: NewUser) -> Result<User, DatabaseError>;
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        Ok(self.users.read().await.get(email).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<User, DatabaseError> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.email) {
            return Err(DatabaseError::Duplicate);
        }
        let created = User::new(user.email, user.password_hash, user.role);
        users.insert(created.email.clone(), created.clone());
        Ok(created)
    }
}

/// Competency persistence. Names are unique.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompetencyStore: Send + Sync {
    /// Fails with [`DatabaseError::Duplicate`] when the name is taken.
    async fn create(&self, name: &str, description: &str) -> Result<Competency, DatabaseError>;

    async fn find_by_id(&self, id: i32) -> Result<Option<Competency>, DatabaseError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Competency>, DatabaseError>;

    /// Every competency, ordered by id.
    async fn list(&self) -> Result<Vec<Competency>, DatabaseError>;

    /// Fails with [`DatabaseError::NotFound`] for an unknown id.
    async fn update_description(&self, id: i32, description: &str) -> Result<Competency, DatabaseError>;
}

#[derive(Debug, Default)]
struct CompetencyTable {
    last_id: i32,
    rows: BTreeMap<i32, Competency>,
}

#[derive(Debug, Default)]
pub struct InMemoryCompetencyStore {
    table: RwLock<CompetencyTable>,
}

impl InMemoryCompetencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompetencyStore for InMemoryCompetencyStore {
    async fn create(&self, name: &str, description: &str) -> Result<Competency, DatabaseError> {
        let mut table = self.table.write().await;
        if table.rows.values().any(|c| c.name == name) {
            return Err(DatabaseError::Duplicate);
        }
        table.last_id += 1;
        let now = Utc::now();
        let competency = Competency {
            id: table.last_id,
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(competency.id, competency.clone());
        Ok(competency)
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<Competency>, DatabaseError> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Competency>, DatabaseError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Competency>, DatabaseError> {
        Ok(self.table.read().await.rows.values().cloned().collect())
    }

    async fn update_description(&self, id: i32, description: &str) -> Result<Competency, DatabaseError> {
        let mut table = self.table.write().await;
        let competency = table.rows.get_mut(&id).ok_or(DatabaseError::NotFound)?;
        competency.description = description.to_string();
        competency.updated_at = Utc::now();
        Ok(competency.clone())
    }
}
