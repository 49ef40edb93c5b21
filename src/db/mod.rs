//! Persistence for user accounts and competencies.
//!
//! The services only see the [`UserStore`] and [`CompetencyStore`] traits;
//! Postgres and in-memory implementations live here.

pub mod models;
pub mod operations;
pub mod store;

pub use models::{Competency, Identity, NewUser, User, UserRole};
pub use operations::PgStore;
pub use store::{CompetencyStore, InMemoryCompetencyStore, InMemoryUserStore, UserStore};
