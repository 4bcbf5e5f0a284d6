use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot reach scheduler database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("database query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("applying migrations failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// None of the candidate migration directories could be read.
    #[error("no migrations directory among [{tried}] ({last_error})")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// The `ports` table returned a value that does not fit in a u16.
    #[error("port {0} in pool is out of range")]
    InvalidPort(i32),
}
