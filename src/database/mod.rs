//! # Database
//!
//! PostgreSQL connection pooling and embedded schema migrations.

pub mod connection;
pub mod migrator;

pub use connection::DatabaseConnection;
pub use migrator::{run_migrations, MIGRATOR};
