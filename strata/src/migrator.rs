use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use futures_util::FutureExt;
use sqlx::{Connection, Database, Pool};

use crate::dialect::Dialect;
use crate::{AppliedMigration, Error, Migration, Result};

/// Name of the tracking table unless overridden with
/// [`Migrator::table_name`].
pub const DEFAULT_TABLE_NAME: &str = "schema_migrations";

/// Applies migrations to one database, against one tracking table, through
/// one [`Dialect`].
///
/// A migrator is configuration plus orchestration; all vendor-specific work
/// happens in the dialect. Cloning is cheap and clones share the dialect.
///
/// ```rust,ignore
/// let migrator = Migrator::new(SqliteDialect).table_name("music_migrations");
/// migrator.apply(&pool, &migrations).await?;
/// ```
pub struct Migrator<DB: Database> {
    schema_name: String,
    table_name: String,
    dialect: Arc<dyn Dialect<DB>>,
}

impl<DB: Database> Clone for Migrator<DB> {
    fn clone(&self) -> Self {
        Self {
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            dialect: Arc::clone(&self.dialect),
        }
    }
}

impl<DB: Database> Migrator<DB> {
    /// Creates a migrator that tracks applied migrations in
    /// [`DEFAULT_TABLE_NAME`], unqualified by any schema.
    pub fn new(dialect: impl Dialect<DB> + 'static) -> Self {
        Self {
            schema_name: String::new(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            dialect: Arc::new(dialect),
        }
    }

    /// Renames the tracking table. Two migrators with different tracking
    /// tables manage independent migration sets on the same database.
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Schema-qualifies the tracking table (for example `public` on
    /// PostgreSQL). Unset by default.
    pub fn schema_name(mut self, schema: impl Into<String>) -> Self {
        self.schema_name = schema.into();
        self
    }

    /// The dialect-quoted, fully-qualified name of the tracking table.
    pub fn quoted_table_name(&self) -> String {
        self.dialect
            .quoted_table_name(&self.schema_name, &self.table_name)
    }
}

#[cfg(feature = "postgres")]
impl Default for Migrator<sqlx::Postgres> {
    fn default() -> Self {
        Self::new(crate::PostgresDialect)
    }
}

impl<DB> Migrator<DB>
where
    DB: Database,
    for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
{
    /// Applies every migration in `migrations` that has not already been
    /// applied, in ascending id order, and records each one in the tracking
    /// table.
    ///
    /// The whole outstanding plan runs inside a single transaction on a
    /// single pooled connection: if any script fails, every script of this
    /// call is rolled back and the tracking table is untouched. (MySQL
    /// auto-commits DDL, so rollback there is best-effort: tracking rows
    /// roll back, completed DDL does not.)
    ///
    /// When the dialect supports locking, a cross-process lock serializes
    /// concurrent `apply` calls against the same tracking table; whichever
    /// caller wins runs the plan, and the others recompute an empty plan
    /// once the lock is theirs. The lock is released on every exit path.
    ///
    /// An empty `migrations` list returns immediately without touching the
    /// database.
    pub async fn apply(&self, pool: &Pool<DB>, migrations: &[Migration]) -> Result<()> {
        if migrations.is_empty() {
            return Ok(());
        }

        let mut conn = pool.acquire().await?;

        if let Some(locker) = self.dialect.locker() {
            locker.lock(&mut conn, &self.table_name).await?;
            tracing::debug!("locked {} for migrations", self.quoted_table_name());
        }

        // Panics below roll the transaction back on drop and must not skip
        // the unlock, so they are caught and carried as plain errors.
        let outcome = AssertUnwindSafe(self.apply_in_transaction(&mut conn, migrations))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Panic(panic_message(panic))));

        if let Some(locker) = self.dialect.locker() {
            match locker.unlock(&mut conn, &self.table_name).await {
                Ok(()) => tracing::debug!("unlocked {}", self.quoted_table_name()),
                Err(unlock_err) => {
                    tracing::debug!(
                        "failed to unlock {}: {}",
                        self.quoted_table_name(),
                        unlock_err
                    );
                    // An error from the migrations themselves wins over the
                    // unlock error.
                    return outcome.and(Err(unlock_err));
                }
            }
        }

        outcome
    }

    /// Reads the tracking table into a map keyed by migration id.
    ///
    /// This is an advisory read: it takes no lock, so a migrator running
    /// elsewhere may commit rows right after it returns.
    pub async fn applied_migrations(
        &self,
        pool: &Pool<DB>,
    ) -> Result<HashMap<String, AppliedMigration>> {
        let mut conn = pool.acquire().await?;
        let applied = self
            .dialect
            .get_applied_migrations(&mut conn, &self.quoted_table_name())
            .await?;
        Ok(applied
            .into_iter()
            .map(|applied| (applied.id.clone(), applied))
            .collect())
    }

    async fn apply_in_transaction(
        &self,
        conn: &mut DB::Connection,
        migrations: &[Migration],
    ) -> Result<()> {
        let mut tx = conn.begin().await?;
        let quoted_table = self.quoted_table_name();

        self.dialect
            .create_migrations_table(&mut tx, &quoted_table)
            .await?;

        let plan = self.compute_plan(&mut tx, &quoted_table, migrations).await?;
        tracing::debug!(
            "{} of {} migrations outstanding in {}",
            plan.len(),
            migrations.len(),
            quoted_table
        );

        for migration in plan {
            self.run_migration(&mut tx, &quoted_table, migration).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// The subset of `migrations` with no tracking row yet, sorted
    /// ascending by id. Must run inside the transaction, after the lock is
    /// held, so the applied set it reads is authoritative.
    async fn compute_plan<'m>(
        &self,
        conn: &mut DB::Connection,
        quoted_table: &str,
        migrations: &'m [Migration],
    ) -> Result<Vec<&'m Migration>> {
        let applied = self
            .dialect
            .get_applied_migrations(&mut *conn, quoted_table)
            .await?;
        let applied_ids: HashSet<&str> = applied.iter().map(|m| m.id.as_str()).collect();

        let mut plan: Vec<&Migration> = migrations
            .iter()
            .filter(|m| !applied_ids.contains(m.id.as_str()))
            .collect();
        plan.sort_by(|a, b| a.id.as_bytes().cmp(b.id.as_bytes()));
        Ok(plan)
    }

    async fn run_migration(
        &self,
        conn: &mut DB::Connection,
        quoted_table: &str,
        migration: &Migration,
    ) -> Result<()> {
        let applied_at = Local::now();
        let clock = Instant::now();

        sqlx::raw_sql(&migration.script)
            .execute(&mut *conn)
            .await
            .map_err(|source| Error::MigrationFailed {
                id: migration.id.clone(),
                source,
            })?;

        let elapsed = clock.elapsed();
        let mut execution_time_in_millis = i32::try_from(elapsed.as_millis()).unwrap_or(i32::MAX);
        if execution_time_in_millis == 0 && elapsed.as_micros() > 0 {
            // Don't round very fast scripts down to "took no time".
            execution_time_in_millis = 1;
        }
        tracing::info!("migration '{}' applied in {:?}", migration.id, elapsed);

        let applied = AppliedMigration {
            id: migration.id.clone(),
            script: migration.script.clone(),
            checksum: migration.fingerprint(),
            execution_time_in_millis,
            applied_at,
        };
        self.dialect
            .insert_applied_migration(&mut *conn, quoted_table, &applied)
            .await
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "sqlite")]
    #[test]
    fn tracks_schema_migrations_by_default() {
        let migrator = Migrator::new(crate::SqliteDialect);
        assert_eq!(migrator.table_name, DEFAULT_TABLE_NAME);
        assert_eq!(migrator.quoted_table_name(), "\"schema_migrations\"");
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn builder_options_compose() {
        let migrator = Migrator::new(crate::SqliteDialect)
            .schema_name("aux")
            .table_name("music_migrations");
        assert_eq!(migrator.quoted_table_name(), "\"aux\".\"music_migrations\"");
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn default_migrator_speaks_postgres() {
        let migrator = Migrator::<sqlx::Postgres>::default();
        assert_eq!(migrator.quoted_table_name(), "\"schema_migrations\"");
    }

    #[test]
    fn panic_payload_messages_survive() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42_u8)), "unknown panic");
    }
}
