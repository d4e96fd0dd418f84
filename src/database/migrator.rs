//! # Database Migration Support
//!
//! Embedded migrations from the root `migrations/` directory: the pgmq extension and
//! the `tasker_dag_*` tables.
//!
//! ```rust,ignore
//! #[sqlx::test(migrator = "tasker_dag::database::migrator::MIGRATOR")]
//! async fn test_feature(pool: PgPool) { /* ... */ }
//! ```

use sqlx::PgPool;
use tracing::info;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, sqlx::migrate::MigrateError>;

/// Apply outstanding migrations; already-applied versions are skipped
pub async fn run_migrations(pool: &PgPool) -> MigrationResult<()> {
    info!(
        migrations = MIGRATOR.iter().count(),
        "Running tasker-dag migrations"
    );
    MIGRATOR.run(pool).await?;
    info!("Migrations complete");
    Ok(())
}
