use std::result;

/// Errors surfaced by [`Migrator::apply`](crate::Migrator::apply) and the
/// built-in dialects.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A migration script failed. The whole plan of the call it belonged to
    /// has been rolled back.
    #[error("Migration '{id}' Failed: {source}")]
    MigrationFailed {
        id: String,
        #[source]
        source: sqlx::Error,
    },

    /// Recording a successfully executed script in the tracking table
    /// failed. Rolled back like a script failure.
    #[error("failed to record applied migration '{id}': {source}")]
    InsertFailed {
        id: String,
        #[source]
        source: sqlx::Error,
    },

    /// Reading the tracking table failed. Usually means another tool altered
    /// the table's columns.
    #[error("failed to read applied migrations. Did somebody change the structure of the {table} table?: {source}")]
    TableStructure {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// The cross-process lock could not be acquired.
    #[error("failed to acquire the migration lock: {0}")]
    Lock(#[source] sqlx::Error),

    /// The database reported the lock as held by someone else for the whole
    /// wait interval (MySQL `GET_LOCK` timing out).
    #[error("could not obtain the migration lock for '{0}'")]
    LockNotAcquired(String),

    /// The cross-process lock could not be released. Reported only when the
    /// migration run itself succeeded.
    #[error("failed to release the migration lock: {0}")]
    Unlock(#[source] sqlx::Error),

    /// A panic escaped a migration. The plan has been rolled back and the
    /// lock released.
    #[error("migration panicked: {0}")]
    Panic(String),

    /// An `applied_at` value in the tracking table could not be interpreted
    /// as a timestamp.
    #[error("cannot parse '{0}' as an applied_at timestamp")]
    Timestamp(String),

    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = result::Result<T, Error>;
