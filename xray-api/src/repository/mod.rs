//! Repository Module
//!
//! Data access layer for the trace store.
//! Each repository handles database operations for a specific entity.

pub mod analytics;
pub mod run;
pub mod step;

// Re-export for convenience
pub use analytics as analytics_repository;
pub use run as run_repository;
pub use step as step_repository;

/// Whether `err` is a unique-constraint violation
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}
