//! Microsoft SQL Server dialect.
//!
//! Mutual exclusion uses session-owned application locks
//! (`sp_getapplock` / `sp_releaseapplock`). The lock outlives transactions
//! but not the session, so the migrator must hold the same physical
//! connection from lock to unlock; before releasing, `APPLOCK_MODE` is
//! consulted and a lock this session does not hold is treated as already
//! released.
//!
//! sqlx ships no SQL Server driver, so unlike the other dialects this one
//! is implemented for any [`sqlx::Database`] whose connection and scalar
//! types satisfy the bounds below, making it usable with an sqlx-compatible
//! third-party driver.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use sqlx::{Database, Row};

use crate::dialect::{quote_ident, Dialect, Locker};
use crate::{AppliedMigration, Error, Result};

const APPLOCK_SALT: u32 = 542_384_964;

/// Dialect for Microsoft SQL Server databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl SqlServerDialect {
    /// Wraps the identifier in brackets, stripping whitespace and
    /// semicolons and doubling embedded closing brackets.
    pub fn quoted_ident(&self, ident: &str) -> String {
        quote_ident(ident, '[', ']')
    }

    fn applock_id(table_name: &str) -> u32 {
        crc32fast::hash(table_name.as_bytes()) ^ APPLOCK_SALT
    }

    /// The unquoted name of the table itself, for the `Sysobjects` lookup:
    /// last segment of the qualified reference with the bracket quoting
    /// undone, and any single quotes doubled so the name can sit inside a
    /// string literal.
    fn object_name(quoted_table: &str) -> String {
        quoted_table
            .rsplit('.')
            .next()
            .unwrap_or(quoted_table)
            .trim_start_matches('[')
            .trim_end_matches(']')
            .replace("]]", "]")
            .replace('\'', "''")
    }

    fn create_sql(quoted_table: &str) -> String {
        let object_name = Self::object_name(quoted_table);
        format!(
            "IF NOT EXISTS (SELECT * FROM Sysobjects WHERE NAME='{object_name}' AND XTYPE='U')
                CREATE TABLE {quoted_table} (
                    id VARCHAR(255) NOT NULL,
                    checksum VARCHAR(32) NOT NULL DEFAULT '',
                    execution_time_in_millis INTEGER NOT NULL DEFAULT 0,
                    applied_at DATETIMEOFFSET NOT NULL
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
            ( @p1, @p2, @p3, @p4 )"
        )
    }
}

#[async_trait]
impl<DB> Dialect<DB> for SqlServerDialect
where
    DB: Database,
    for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
    for<'q> DB::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    usize: sqlx::ColumnIndex<DB::Row>,
    String: for<'r> sqlx::Decode<'r, DB> + for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    i32: for<'r> sqlx::Decode<'r, DB> + for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    DateTime<Utc>: for<'r> sqlx::Decode<'r, DB> + for<'q> sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
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
        conn: &mut DB::Connection,
        quoted_table: &str,
    ) -> Result<()> {
        match sqlx::query(&Self::create_sql(quoted_table))
            .execute(&mut *conn)
            .await
        {
            Ok(_) => Ok(()),
            // Lost a concurrent-creation race; the table is there.
            Err(err) if err.to_string().contains("There is already an object named") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_applied_migrations(
        &self,
        conn: &mut DB::Connection,
        quoted_table: &str,
    ) -> Result<Vec<AppliedMigration>> {
        let drift = |source| Error::TableStructure {
            table: quoted_table.to_string(),
            source,
        };

        let rows = sqlx::query(&Self::select_sql(quoted_table))
            .fetch_all(&mut *conn)
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
        conn: &mut DB::Connection,
        quoted_table: &str,
        applied: &AppliedMigration,
    ) -> Result<()> {
        sqlx::query(&Self::insert_sql(quoted_table))
            .bind(applied.id.clone())
            .bind(applied.checksum.clone())
            .bind(applied.execution_time_in_millis)
            .bind(applied.applied_at.with_timezone(&Utc))
            .execute(&mut *conn)
            .await
            .map_err(|source| Error::InsertFailed {
                id: applied.id.clone(),
                source,
            })?;
        Ok(())
    }

    fn locker(&self) -> Option<&dyn Locker<DB>> {
        Some(self)
    }
}

#[async_trait]
impl<DB> Locker<DB> for SqlServerDialect
where
    DB: Database,
    for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
    for<'q> DB::Arguments<'q>: sqlx::IntoArguments<'q, DB>,
    usize: sqlx::ColumnIndex<DB::Row>,
    String: for<'r> sqlx::Decode<'r, DB> + sqlx::Type<DB>,
{
    async fn lock(&self, conn: &mut DB::Connection, table_name: &str) -> Result<()> {
        let lock_id = Self::applock_id(table_name);
        sqlx::query(&format!(
            "EXEC sp_getapplock @Resource = '{lock_id}', @LockMode = 'Exclusive', @LockOwner = 'Session';"
        ))
        .execute(&mut *conn)
        .await
        .map_err(Error::Lock)?;
        Ok(())
    }

    async fn unlock(&self, conn: &mut DB::Connection, table_name: &str) -> Result<()> {
        let lock_id = Self::applock_id(table_name);

        // Releasing a lock this session does not hold is an error in SQL
        // Server, so check first; an inconclusive check counts as released.
        let check = format!("SELECT APPLOCK_MODE('public', '{lock_id}', 'Session');");
        let mode: Option<String> = match sqlx::query(&check).fetch_one(&mut *conn).await {
            Ok(row) => row.try_get(0).ok(),
            Err(_) => return Ok(()),
        };
        if matches!(mode.as_deref(), None | Some("NoLock")) {
            return Ok(());
        }

        sqlx::query(&format!(
            "EXEC sp_releaseapplock @Resource = '{lock_id}', @LockOwner = 'Session';"
        ))
        .execute(&mut *conn)
        .await
        .map_err(Error::Unlock)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_with_brackets() {
        assert_eq!(SqlServerDialect.quoted_ident("users_roles"), "[users_roles]");
        assert_eq!(
            SqlServerDialect.quoted_ident("table[with]brackets"),
            "[table[with]]brackets]"
        );
    }

    #[test]
    fn defangs_injection_attempts() {
        assert_eq!(
            SqlServerDialect.quoted_ident("; DROP TABLE users"),
            "[DROPTABLEusers]"
        );
    }

    #[test]
    fn applock_id_xors_the_salt() {
        let raw = crc32fast::hash(b"schema_migrations");
        assert_eq!(
            SqlServerDialect::applock_id("schema_migrations"),
            raw ^ 542_384_964
        );
    }

    #[test]
    fn object_name_unquotes_the_last_segment() {
        assert_eq!(
            SqlServerDialect::object_name("[schema_migrations]"),
            "schema_migrations"
        );
        assert_eq!(
            SqlServerDialect::object_name("[dbo].[schema_migrations]"),
            "schema_migrations"
        );
        assert_eq!(
            SqlServerDialect::object_name("[odd]]name]"),
            "odd]name"
        );
    }

    #[test]
    fn create_sql_guards_with_sysobjects() {
        let create = SqlServerDialect::create_sql("[dbo].[schema_migrations]");
        assert!(create.contains("IF NOT EXISTS (SELECT * FROM Sysobjects WHERE NAME='schema_migrations' AND XTYPE='U')"));
        assert!(create.contains("CREATE TABLE [dbo].[schema_migrations]"));
        assert!(create.contains("applied_at DATETIMEOFFSET NOT NULL"));
    }

    #[test]
    fn insert_sql_uses_numbered_parameters() {
        let insert = SqlServerDialect::insert_sql("[schema_migrations]");
        assert!(insert.contains("( @p1, @p2, @p3, @p4 )"));
    }
}
