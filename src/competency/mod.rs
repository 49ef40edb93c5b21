//! Competency catalogue: create, read and describe named skills.

pub mod handlers;
mod service;

pub use service::{CompetencyService, MAX_NAME_BYTES, MIN_NAME_BYTES};
