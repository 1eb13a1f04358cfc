//! Migration sources for the `strata` migration runner.
//!
//! [`Migrator::apply`](strata::Migrator) takes a plain list of
//! [`Migration`]s and doesn't care where it came from; this crate builds
//! that list from the places migrations usually live:
//!
//! - [`migrations_from_directory`] - every `*.sql` file in a directory
//! - [`migrations_from_embedded`] - files compiled into the binary with
//!   [`include_dir`]
//! - [`migration_from_file_path`] / [`migration_from_reader`] - one-off
//!   sources
//!
//! In every case the migration id is the file name with the directory and
//! final extension stripped, so `migrations/2019-09-17 Create Albums.sql`
//! becomes the id `2019-09-17 Create Albums`. The runner sorts by id, so
//! file names decide execution order.
//!
//! # Usage
//!
//! ```rust,ignore
//! use include_dir::{include_dir, Dir};
//!
//! static MIGRATIONS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/migrations");
//!
//! let migrations = strata_files::migrations_from_embedded(&MIGRATIONS, "*.sql")?;
//! migrator.apply(&pool, &migrations).await?;
//! ```

use std::fs;
use std::io::Read;
use std::path::Path;

use include_dir::Dir;
use strata::Migration;

/// Errors from reading migration sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The glob pattern itself is malformed. Reported before any file is
    /// touched.
    #[error("invalid migration glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A matched path could not be examined.
    #[error("failed to resolve migration path: {0}")]
    Glob(#[from] glob::GlobError),

    /// The supplied directory is valid-looking but absent. Distinguished
    /// from "no matches" so a mistyped path doesn't silently apply nothing.
    #[error("migrations directory does not exist: {0}")]
    MissingDirectory(String),

    #[error("failed to read migration from '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An embedded migration's bytes are not valid UTF-8.
    #[error("migration '{0}' is not valid UTF-8")]
    NonUtf8(String),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Strips the directory and final extension from a path to make a
/// friendlier migration id.
pub fn migration_id_from_filename(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reads every `*.sql` file in `dir_path` into a migration. The glob's
/// alphabetical traversal means the returned list is already in id order,
/// but callers don't need to rely on that; the runner re-sorts.
pub fn migrations_from_directory(dir_path: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let dir_path = dir_path.as_ref();
    let pattern = dir_path.join("*.sql");
    let entries = glob::glob(&pattern.to_string_lossy())?;

    if !dir_path.is_dir() {
        return Err(SourceError::MissingDirectory(
            dir_path.display().to_string(),
        ));
    }

    let mut migrations = Vec::new();
    for entry in entries {
        migrations.push(migration_from_file_path(entry?)?);
    }
    Ok(migrations)
}

/// Reads the files matching `pattern` (relative to `dir`) out of an
/// embedded directory tree.
pub fn migrations_from_embedded(dir: &Dir<'_>, pattern: &str) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    for entry in dir.find(pattern)? {
        let Some(file) = entry.as_file() else {
            continue;
        };
        let script = file.contents_utf8().ok_or_else(|| {
            SourceError::NonUtf8(file.path().display().to_string())
        })?;
        migrations.push(Migration::new(
            migration_id_from_filename(&file.path().to_string_lossy()),
            script,
        ));
    }
    Ok(migrations)
}

/// Builds one migration from a file on disk.
pub fn migration_from_file_path(path: impl AsRef<Path>) -> Result<Migration> {
    let path = path.as_ref();
    let script = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Migration::new(
        migration_id_from_filename(&path.to_string_lossy()),
        script,
    ))
}

/// Builds one migration from any open readable source. The id is derived
/// from `name` the same way as for files; the reader is not closed.
pub fn migration_from_reader(name: &str, reader: &mut impl Read) -> Result<Migration> {
    let mut script = String::new();
    reader
        .read_to_string(&mut script)
        .map_err(|source| SourceError::Io {
            path: name.to_string(),
            source,
        })?;
    Ok(Migration::new(migration_id_from_filename(name), script))
}

#[cfg(test)]
mod tests {
    use super::*;
    use include_dir::include_dir;
    use std::fs::File;
    use std::io::Write;

    static EMBEDDED: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/testdata/migrations");

    fn write_sql(dir: &Path, name: &str, contents: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn id_strips_directory_and_final_extension() {
        assert_eq!(
            migration_id_from_filename("migrations/2019-01-01 init.sql"),
            "2019-01-01 init"
        );
        assert_eq!(migration_id_from_filename("plain.sql"), "plain");
        assert_eq!(migration_id_from_filename("dotted.name.sql"), "dotted.name");
    }

    #[test]
    fn directory_source_reads_only_sql_files() {
        let dir = tempfile::tempdir().unwrap();
        write_sql(dir.path(), "0001 users.sql", "CREATE TABLE users (id INTEGER);");
        write_sql(dir.path(), "0002 roles.sql", "CREATE TABLE roles (id INTEGER);");
        write_sql(dir.path(), "notes.txt", "not a migration");

        let migrations = migrations_from_directory(dir.path()).unwrap();
        let ids: Vec<&str> = migrations.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["0001 users", "0002 roles"]);
        assert_eq!(migrations[0].script, "CREATE TABLE users (id INTEGER);");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never-created");
        assert!(matches!(
            migrations_from_directory(&gone),
            Err(SourceError::MissingDirectory(_))
        ));
    }

    #[test]
    fn empty_directory_yields_no_migrations() {
        let dir = tempfile::tempdir().unwrap();
        assert!(migrations_from_directory(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn embedded_source_matches_a_glob() {
        let mut migrations = migrations_from_embedded(&EMBEDDED, "*.sql").unwrap();
        strata::sort_migrations(&mut migrations);
        let ids: Vec<&str> = migrations.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["0001 albums", "0002 artists"]);
        assert!(migrations[0].script.contains("CREATE TABLE albums"));
    }

    #[test]
    fn embedded_source_rejects_bad_patterns() {
        assert!(matches!(
            migrations_from_embedded(&EMBEDDED, "[["),
            Err(SourceError::Pattern(_))
        ));
    }

    #[test]
    fn reader_source_uses_the_supplied_name() {
        let mut script = "CREATE TABLE t (id INTEGER);".as_bytes();
        let migration = migration_from_reader("0001 t.sql", &mut script).unwrap();
        assert_eq!(migration.id, "0001 t");
        assert_eq!(migration.script, "CREATE TABLE t (id INTEGER);");
    }
}
