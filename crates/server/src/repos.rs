//! Database access (PostgreSQL).
//!
//! Business data lives with external collaborators; this layer only needs
//! to know whether the database is reachable.

mod status;

pub use status::{DatabaseProbe, PgDatabaseProbe};

#[cfg(test)]
pub use status::MockDatabaseProbe;
