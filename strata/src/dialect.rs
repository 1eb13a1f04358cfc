//! The per-vendor capability bundle driven by [`Migrator`](crate::Migrator).
//!
//! A [`Dialect`] owns everything that differs between database vendors:
//! identifier quoting, the tracking-table DDL, how applied rows are read and
//! written, and (optionally, through [`Locker`]) a cross-process lock. The
//! migrator itself only sequences these calls.

use async_trait::async_trait;
use sqlx::Database;

use crate::{AppliedMigration, Result};

/// Vendor-specific SQL generation and tracking-table access.
///
/// Implementations for PostgreSQL, MySQL/MariaDB, SQLite, and SQL Server
/// ship with the crate behind their Cargo features; callers may supply
/// their own implementation to [`Migrator::new`](crate::Migrator::new) for
/// anything else.
#[async_trait]
pub trait Dialect<DB: Database>: Send + Sync {
    /// The vendor-quoted, fully-qualified reference to the tracking table.
    /// When `schema_name` is empty, only the quoted table name is returned;
    /// otherwise the two quoted parts are joined with `.`.
    fn quoted_table_name(&self, schema_name: &str, table_name: &str) -> String;

    /// Creates the tracking table if it is absent. Idempotent: concurrent
    /// callers racing to create the table must all see success.
    async fn create_migrations_table(
        &self,
        conn: &mut DB::Connection,
        quoted_table: &str,
    ) -> Result<()>;

    /// Reads every applied row, ordered by id ascending. Scan failures are
    /// wrapped with a message naming the table so operators can recognize
    /// schema drift.
    async fn get_applied_migrations(
        &self,
        conn: &mut DB::Connection,
        quoted_table: &str,
    ) -> Result<Vec<AppliedMigration>>;

    /// Inserts one applied row. Not idempotent; a duplicate id is an error.
    async fn insert_applied_migration(
        &self,
        conn: &mut DB::Connection,
        quoted_table: &str,
        applied: &AppliedMigration,
    ) -> Result<()>;

    /// The dialect's cross-process lock, if it has one. When `None`, the
    /// migrator proceeds without mutual exclusion, which is acceptable for
    /// single-writer databases.
    fn locker(&self) -> Option<&dyn Locker<DB>> {
        None
    }
}

/// Cross-process mutual exclusion for the duration of one
/// [`Migrator::apply`](crate::Migrator::apply) run.
///
/// `lock` and `unlock` are called on the same physical connection, outside
/// the migration transaction. Dialects implement both or neither.
#[async_trait]
pub trait Locker<DB: Database>: Send + Sync {
    async fn lock(&self, conn: &mut DB::Connection, table_name: &str) -> Result<()>;

    async fn unlock(&self, conn: &mut DB::Connection, table_name: &str) -> Result<()>;
}

/// Quotes `ident` between `open` and `close`, dropping whitespace and
/// semicolons and doubling any embedded `close` character. The table name
/// cannot be parameter-bound, so this is the defense against identifier
/// injection; every dialect quotes through here.
pub(crate) fn quote_ident(ident: &str, open: char, close: char) -> String {
    if ident.is_empty() {
        return String::new();
    }

    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push(open);
    for c in ident.chars() {
        if c.is_whitespace() || c == ';' {
            continue;
        }
        if c == close {
            quoted.push(close);
            quoted.push(close);
        } else {
            quoted.push(c);
        }
    }
    quoted.push(close);
    quoted
}

#[cfg(test)]
mod tests {
    use super::quote_ident;

    #[test]
    fn empty_identifier_stays_empty() {
        assert_eq!(quote_ident("", '"', '"'), "");
    }

    #[test]
    fn strips_whitespace_and_semicolons() {
        assert_eq!(
            quote_ident("; DROP TABLE users", '"', '"'),
            "\"DROPTABLEusers\""
        );
        assert_eq!(quote_ident("tab\tle\n", '`', '`'), "`table`");
    }

    #[test]
    fn doubles_the_closing_character_only() {
        assert_eq!(
            quote_ident("table\"with\"quotes", '"', '"'),
            "\"table\"\"with\"\"quotes\""
        );
        assert_eq!(
            quote_ident("table[with]brackets", '[', ']'),
            "[table[with]]brackets]"
        );
    }
}
