//! Embeddable schema migrations for SQL databases.
//!
//! This crate keeps a database's schema up to date from inside the
//! application that owns it. The host hands [`Migrator::apply`] a list of
//! [`Migration`]s (an id plus a SQL script) and an open [`sqlx::Pool`]; the
//! migrator guarantees that each script runs exactly once per database, in
//! ascending id order, even when several instances of the application start
//! at the same time and race to migrate the same database.
//!
//! Successfully applied migrations are recorded in a tracking table
//! (`schema_migrations` unless renamed) holding the migration id, an MD5
//! checksum of the script, the execution time in milliseconds, and the time
//! at which the script started executing.
//!
//! # Features
//!
//! - **`sqlite`** - Enables the SQLite dialect
//! - **`mysql`** - Enables the MySQL/MariaDB dialect
//! - **`postgres`** - Enables the PostgreSQL dialect
//! - **`mssql`** - Enables the SQL Server dialect
//!
//! All features are enabled by default. You can selectively enable only the
//! databases you need:
//!
//! ```toml
//! [dependencies]
//! strata = { version = "0.1", default-features = false, features = ["postgres"] }
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use strata::{Migration, Migrator, PostgresDialect};
//!
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//!
//! let migrations = vec![
//!     Migration::new("2019-09-17 Create Albums", "CREATE TABLE albums ( id SERIAL PRIMARY KEY )"),
//!     Migration::new("2019-09-18 Add Artist", "ALTER TABLE albums ADD artist TEXT"),
//! ];
//!
//! let migrator = Migrator::new(PostgresDialect);
//! migrator.apply(&pool, &migrations).await?;
//! ```
//!
//! Calling `apply` again with the same list is a no-op. The order of the
//! input list does not matter; outstanding migrations always execute in
//! ascending id order.
//!
//! # Concurrency
//!
//! `apply` borrows a single pooled connection for the whole run, takes a
//! cross-process lock where the database offers one (PostgreSQL advisory
//! locks, MySQL named locks, SQL Server application locks), and executes the
//! whole outstanding plan inside one transaction. A failing script rolls the
//! entire plan back and releases the lock. SQLite is single-writer, so its
//! dialect carries no lock.
//!
//! # Custom dialects
//!
//! The per-vendor behavior lives behind the [`Dialect`] trait; callers can
//! supply their own implementation to `Migrator::new` to target a database
//! this crate does not ship support for. Dialects that also implement
//! [`Locker`] get cross-process mutual exclusion; the migrator simply skips
//! locking for dialects that do not.

mod dialect;
mod error;
mod migration;
mod migrator;

#[cfg(any(feature = "sqlite", feature = "mysql"))]
pub(crate) mod timestamp;

#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use dialect::{Dialect, Locker};
pub use error::{Error, Result};
pub use migration::{sort_migrations, AppliedMigration, Migration};
pub use migrator::{Migrator, DEFAULT_TABLE_NAME};

#[cfg(feature = "mssql")]
pub use mssql::SqlServerDialect;
#[cfg(feature = "mysql")]
pub use mysql::MySqlDialect;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDialect;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDialect;
