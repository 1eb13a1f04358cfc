use chrono::{DateTime, Local};
use md5::{Digest, Md5};

/// A yet-to-be-run change to the schema.
///
/// The `id` is opaque text that doubles as the sort key: outstanding
/// migrations execute in ascending byte order of their ids, so
/// date-prefixed ids (`2019-09-17 Create Albums`) run in the order they
/// were written. The `script` is raw SQL and may contain several
/// statements.
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: String,
    pub script: String,
}

impl Migration {
    pub fn new(id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: script.into(),
        }
    }

    /// Lowercase-hex MD5 of the script text. Stored in the tracking table's
    /// `checksum` column at apply time for auditing; never used to validate
    /// previously applied rows.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.script.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Two migrations are the same migration when their ids match, whatever
/// their scripts say.
impl PartialEq for Migration {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Migration {}

/// Stable ascending sort by raw byte comparison of the ids (not
/// locale-aware).
pub fn sort_migrations(migrations: &mut [Migration]) {
    migrations.sort_by(|a, b| a.id.as_bytes().cmp(b.id.as_bytes()));
}

/// A schema change which was successfully completed, as recorded in the
/// tracking table.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub id: String,

    /// The SQL that ran. Populated when the migration is applied; rows read
    /// back from the tracking table leave it empty, since only the checksum
    /// is stored.
    pub script: String,

    /// MD5 of the script, captured at apply time.
    pub checksum: String,

    /// How long the script took. Sub-millisecond (but non-zero) executions
    /// are recorded as 1 so they don't round down to "free".
    pub execution_time_in_millis: i32,

    /// When the script *started* executing (not when it completed),
    /// normalized to the caller's local zone on read.
    pub applied_at: DateTime<Local>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_lowercase_hex_md5() {
        let migration = Migration::new("any", "test");
        assert_eq!(migration.fingerprint(), "098f6bcd4621d373cade4e832627b4f6");
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Migration::new("a", "CREATE TABLE t (id INTEGER)");
        let b = Migration::new("b", "CREATE TABLE t (id INTEGER)");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(
            a.fingerprint(),
            Migration::new("a", "CREATE TABLE u (id INTEGER)").fingerprint()
        );
    }

    #[test]
    fn equality_is_by_id() {
        assert_eq!(
            Migration::new("2019-01-01", "CREATE TABLE a (id INTEGER)"),
            Migration::new("2019-01-01", "something else entirely")
        );
        assert_ne!(
            Migration::new("2019-01-01", "CREATE TABLE a (id INTEGER)"),
            Migration::new("2019-01-02", "CREATE TABLE a (id INTEGER)")
        );
    }

    #[test]
    fn sort_orders_by_id_bytes() {
        let mut migrations = vec![
            Migration::new("b", ""),
            Migration::new("A", ""),
            Migration::new("a", ""),
            Migration::new("2000-01-01", ""),
        ];
        sort_migrations(&mut migrations);
        let ids: Vec<&str> = migrations.iter().map(|m| m.id.as_str()).collect();
        // Plain byte order: digits before uppercase before lowercase.
        assert_eq!(ids, vec!["2000-01-01", "A", "a", "b"]);
    }

    #[test]
    fn sort_is_stable() {
        let mut migrations = vec![
            Migration::new("same", "first"),
            Migration::new("same", "second"),
        ];
        sort_migrations(&mut migrations);
        assert_eq!(migrations[0].script, "first");
        assert_eq!(migrations[1].script, "second");
    }
}
