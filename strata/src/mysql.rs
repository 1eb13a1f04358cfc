//! MySQL / MariaDB dialect.
//!
//! Mutual exclusion uses named user locks (`GET_LOCK` / `RELEASE_LOCK`)
//! whose name is the decimal form of a salted CRC32 of the tracking-table
//! name. MySQL auto-commits DDL, so the atomicity of a failed plan is
//! best-effort there: tracking rows roll back, already-committed DDL does
//! not.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use sqlx::{MySql, MySqlConnection, Row};

use crate::dialect::{quote_ident, Dialect, Locker};
use crate::{timestamp, AppliedMigration, Error, Result};

const LOCK_SALT: u32 = 271_192_482;

/// How long `GET_LOCK` waits for a concurrent migrator, in seconds.
const LOCK_WAIT_SECONDS: u32 = 10;

/// Dialect for MySQL and MariaDB databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    /// Wraps the identifier in backticks, stripping whitespace and
    /// semicolons and doubling embedded backticks.
    pub fn quoted_ident(&self, ident: &str) -> String {
        quote_ident(ident, '`', '`')
    }

    fn lock_name(table_name: &str) -> u32 {
        crc32fast::hash(table_name.as_bytes()).wrapping_mul(LOCK_SALT)
    }

    fn create_sql(quoted_table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {quoted_table} (
                id VARCHAR(255) NOT NULL,
                checksum VARCHAR(32) NOT NULL DEFAULT '',
                execution_time_in_millis INTEGER NOT NULL DEFAULT 0,
                applied_at TIMESTAMP NOT NULL
            )"
        )
    }

    fn select_sql(quoted_table: &str) -> String {
        format!(
            "SELECT id, checksum, execution_time_in_millis, applied_at
            FROM {quoted_table} ORDER BY id ASC"
        )
    }

    fn insert_sql(quoted_table: &str) -> String {
        format!(
            "INSERT INTO {quoted_table}
            ( id, checksum, execution_time_in_millis, applied_at )
            VALUES
            ( ?, ?, ?, ? )"
        )
    }
}

#[async_trait]
impl Dialect<MySql> for MySqlDialect {
    fn quoted_table_name(&self, schema_name: &str, table_name: &str) -> String {
        if schema_name.is_empty() {
            self.quoted_ident(table_name)
        } else {
            format!(
                "{}.{}",
                self.quoted_ident(schema_name),
                self.quoted_ident(table_name)
            )
        }
    }

    async fn create_migrations_table(
        &self,
        conn: &mut MySqlConnection,
        quoted_table: &str,
    ) -> Result<()> {
        sqlx::query(&Self::create_sql(quoted_table))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn get_applied_migrations(
        &self,
        conn: &mut MySqlConnection,
        quoted_table: &str,
    ) -> Result<Vec<AppliedMigration>> {
        let drift = |source| Error::TableStructure {
            table: quoted_table.to_string(),
            source,
        };

        let rows = sqlx::query(&Self::select_sql(quoted_table))
            .fetch_all(conn)
            .await
            .map_err(drift)?;

        let mut migrations = Vec::with_capacity(rows.len());
        for row in rows {
            // TIMESTAMP usually decodes directly; zone-naive configurations
            // fall back to text scanning.
            let applied_at = match row.try_get::<DateTime<Utc>, _>(3) {
                Ok(parsed) => parsed.with_timezone(&Local),
                Err(_) => {
                    let raw: Option<String> = row.try_get(3).map_err(drift)?;
                    timestamp::scan_text(raw.as_deref())?
                }
            };
            migrations.push(AppliedMigration {
                id: row.try_get(0).map_err(drift)?,
                script: String::new(),
                checksum: row.try_get(1).map_err(drift)?,
                execution_time_in_millis: row.try_get(2).map_err(drift)?,
                applied_at,
            });
        }

        Ok(migrations)
    }

    async fn insert_applied_migration(
        &self,
        conn: &mut MySqlConnection,
        quoted_table: &str,
        applied: &AppliedMigration,
    ) -> Result<()> {
        sqlx::query(&Self::insert_sql(quoted_table))
            .bind(&applied.id)
            .bind(&applied.checksum)
            .bind(applied.execution_time_in_millis)
            .bind(applied.applied_at.with_timezone(&Utc))
            .execute(conn)
            .await
            .map_err(|source| Error::InsertFailed {
                id: applied.id.clone(),
                source,
            })?;
        Ok(())
    }

    fn locker(&self) -> Option<&dyn Locker<MySql>> {
        Some(self)
    }
}

#[async_trait]
impl Locker<MySql> for MySqlDialect {
    async fn lock(&self, conn: &mut MySqlConnection, table_name: &str) -> Result<()> {
        let name = Self::lock_name(table_name);
        let row = sqlx::query(&format!("SELECT GET_LOCK('{name}', {LOCK_WAIT_SECONDS})"))
            .fetch_one(conn)
            .await
            .map_err(Error::Lock)?;
        // 1 = acquired; 0 = timed out waiting; NULL = error.
        let acquired: Option<i64> = row.try_get(0).map_err(Error::Lock)?;
        if acquired != Some(1) {
            return Err(Error::LockNotAcquired(table_name.to_string()));
        }
        Ok(())
    }

    async fn unlock(&self, conn: &mut MySqlConnection, table_name: &str) -> Result<()> {
        let name = Self::lock_name(table_name);
        sqlx::query(&format!("SELECT RELEASE_LOCK('{name}')"))
            .execute(conn)
            .await
            .map_err(Error::Unlock)?;
        Ok(())
    }
}
