//! PostgreSQL dialect.
//!
//! Cross-process mutual exclusion uses session-scoped advisory locks
//! (`pg_advisory_lock` / `pg_advisory_unlock`) keyed by a CRC32 of the
//! tracking-table name, salted so the key space doesn't collide with other
//! tools locking the same database.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use sqlx::{PgConnection, Postgres, Row};

use crate::dialect::{quote_ident, Dialect, Locker};
use crate::{AppliedMigration, Error, Result};

const ADVISORY_LOCK_SALT: u32 = 542_384_964;

/// Dialect for PostgreSQL-compatible databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Wraps the identifier in double quotes, stripping whitespace and
    /// semicolons and doubling embedded quote characters.
    pub fn quoted_ident(&self, ident: &str) -> String {
        quote_ident(ident, '"', '"')
    }

    fn advisory_lock_id(table_name: &str) -> u32 {
        crc32fast::hash(table_name.as_bytes()).wrapping_mul(ADVISORY_LOCK_SALT)
    }

    fn create_sql(quoted_table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {quoted_table} (
                id VARCHAR(255) NOT NULL,
                checksum VARCHAR(32) NOT NULL DEFAULT '',
                execution_time_in_millis INTEGER NOT NULL DEFAULT 0,
                applied_at TIMESTAMP WITH TIME ZONE NOT NULL
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
            ( $1, $2, $3, $4 )"
        )
    }
}

#[async_trait]
impl Dialect<Postgres> for PostgresDialect {
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
        conn: &mut PgConnection,
        quoted_table: &str,
    ) -> Result<()> {
        sqlx::query(&Self::create_sql(quoted_table))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn get_applied_migrations(
        &self,
        conn: &mut PgConnection,
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
            let applied_at: DateTime<Utc> = row.try_get(3).map_err(drift)?;
            migrations.push(AppliedMigration {
                id: row.try_get(0).map_err(drift)?,
                script: String::new(),
                checksum: row.try_get(1).map_err(drift)?,
                execution_time_in_millis: row.try_get(2).map_err(drift)?,
                applied_at: applied_at.with_timezone(&Local),
            });
        }

        Ok(migrations)
    }

    async fn insert_applied_migration(
        &self,
        conn: &mut PgConnection,
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

    fn locker(&self) -> Option<&dyn Locker<Postgres>> {
        Some(self)
    }
}

#[async_trait]
impl Locker<Postgres> for PostgresDialect {
    async fn lock(&self, conn: &mut PgConnection, table_name: &str) -> Result<()> {
        let lock_id = Self::advisory_lock_id(table_name);
        sqlx::query(&format!("SELECT pg_advisory_lock({lock_id})"))
            .execute(conn)
            .await
            .map_err(Error::Lock)?;
        Ok(())
    }

    async fn unlock(&self, conn: &mut PgConnection, table_name: &str) -> Result<()> {
        let lock_id = Self::advisory_lock_id(table_name);
        sqlx::query(&format!("SELECT pg_advisory_unlock({lock_id})"))
            .execute(conn)
            .await
            .map_err(Error::Unlock)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dialect;

    #[test]
    fn quotes_plain_identifiers() {
        assert_eq!(
            PostgresDialect.quoted_ident("users_roles"),
            "\"users_roles\""
        );
    }

    #[test]
    fn doubles_embedded_quotes() {
        assert_eq!(
            PostgresDialect.quoted_ident("table\"with\"quotes"),
            "\"table\"\"with\"\"quotes\""
        );
    }

    #[test]
    fn defangs_injection_attempts() {
        assert_eq!(
            PostgresDialect.quoted_ident("; DROP TABLE users"),
            "\"DROPTABLEusers\""
        );
    }

    #[test]
    fn schema_qualifies_with_a_dot() {
        assert_eq!(
            PostgresDialect.quoted_table_name("public", "schema_migrations"),
            "\"public\".\"schema_migrations\""
        );
        assert_eq!(
            PostgresDialect.quoted_table_name("", "schema_migrations"),
            "\"schema_migrations\""
        );
    }

    #[test]
    fn lock_id_is_deterministic_per_table() {
        let a = PostgresDialect::advisory_lock_id("schema_migrations");
        assert_eq!(a, PostgresDialect::advisory_lock_id("schema_migrations"));
        assert_ne!(a, PostgresDialect::advisory_lock_id("music_migrations"));
    }

    #[test]
    fn lock_id_applies_the_salt() {
        let raw = crc32fast::hash(b"schema_migrations");
        assert_eq!(
            PostgresDialect::advisory_lock_id("schema_migrations"),
            raw.wrapping_mul(542_384_964)
        );
    }

    #[test]
    fn tracking_table_sql_shape() {
        let create = PostgresDialect::create_sql("\"schema_migrations\"");
        assert!(create.starts_with("CREATE TABLE IF NOT EXISTS \"schema_migrations\""));
        for column in [
            "id VARCHAR(255) NOT NULL",
            "checksum VARCHAR(32) NOT NULL DEFAULT ''",
            "execution_time_in_millis INTEGER NOT NULL DEFAULT 0",
            "applied_at TIMESTAMP WITH TIME ZONE NOT NULL",
        ] {
            assert!(create.contains(column), "missing column in: {create}");
        }

        let select = PostgresDialect::select_sql("\"schema_migrations\"");
        assert!(select.contains("ORDER BY id ASC"));

        let insert = PostgresDialect::insert_sql("\"schema_migrations\"");
        assert!(insert.contains("( $1, $2, $3, $4 )"));
    }
}
