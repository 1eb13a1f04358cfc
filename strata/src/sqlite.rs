//! SQLite dialect.
//!
//! SQLite is a single-writer embedded database and this runner lives inside
//! the application process, so the dialect carries no cross-process lock;
//! the migrator runs unlocked. Timestamps are stored as 19-character UTC
//! text and scanned back through [`timestamp::scan_text`].

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqliteConnection};

use crate::dialect::{quote_ident, Dialect};
use crate::{timestamp, AppliedMigration, Error, Result};

/// Dialect for SQLite databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Wraps the identifier in double quotes, stripping whitespace and
    /// semicolons and doubling embedded quote characters.
    pub fn quoted_ident(&self, ident: &str) -> String {
        quote_ident(ident, '"', '"')
    }

    fn create_sql(quoted_table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {quoted_table} (
                id TEXT NOT NULL,
                checksum TEXT NOT NULL DEFAULT '',
                execution_time_in_millis INTEGER NOT NULL DEFAULT 0,
                applied_at DATETIME NOT NULL
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
impl Dialect<Sqlite> for SqliteDialect {
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
        conn: &mut SqliteConnection,
        quoted_table: &str,
    ) -> Result<()> {
        sqlx::query(&Self::create_sql(quoted_table))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn get_applied_migrations(
        &self,
        conn: &mut SqliteConnection,
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
            let raw: Option<String> = row.try_get(3).map_err(drift)?;
            migrations.push(AppliedMigration {
                id: row.try_get(0).map_err(drift)?,
                script: String::new(),
                checksum: row.try_get(1).map_err(drift)?,
                execution_time_in_millis: row.try_get(2).map_err(drift)?,
                applied_at: timestamp::scan_text(raw.as_deref())?,
            });
        }

        Ok(migrations)
    }

    async fn insert_applied_migration(
        &self,
        conn: &mut SqliteConnection,
        quoted_table: &str,
        applied: &AppliedMigration,
    ) -> Result<()> {
        sqlx::query(&Self::insert_sql(quoted_table))
            .bind(&applied.id)
            .bind(&applied.checksum)
            .bind(applied.execution_time_in_millis)
            .bind(timestamp::to_naive_utc(applied.applied_at))
            .execute(conn)
            .await
            .map_err(|source| Error::InsertFailed {
                id: applied.id.clone(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dialect;

    #[test]
    fn quotes_like_postgres() {
        assert_eq!(SqliteDialect.quoted_ident("users_roles"), "\"users_roles\"");
        assert_eq!(
            SqliteDialect.quoted_ident("table\"with\"quotes"),
            "\"table\"\"with\"\"quotes\""
        );
    }

    #[test]
    fn defangs_injection_attempts() {
        assert_eq!(
            SqliteDialect.quoted_ident("; DROP TABLE users"),
            "\"DROPTABLEusers\""
        );
    }

    #[test]
    fn attached_database_qualifies_with_a_dot() {
        assert_eq!(
            SqliteDialect.quoted_table_name("aux", "schema_migrations"),
            "\"aux\".\"schema_migrations\""
        );
    }

    #[test]
    fn has_no_locker() {
        assert!(<SqliteDialect as Dialect<Sqlite>>::locker(&SqliteDialect).is_none());
    }

    #[test]
    fn tracking_table_sql_shape() {
        let create = SqliteDialect::create_sql("\"schema_migrations\"");
        assert!(create.contains("id TEXT NOT NULL"));
        assert!(create.contains("applied_at DATETIME NOT NULL"));
    }
}
