use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use crate::constants::{IDENTITY_DB, META_DIR};
use crate::domain::{IdentityKey, PartitionKey};
use crate::error::{CurateError, Result};

/// Identity keys of committed cleaned partitions, so re-delivered records
/// landing in another partition can be recognized.
///
/// Each partition's key set is replaced as a unit together with the digest of
/// the commit it describes; a digest mismatch means the index is stale for
/// that partition and must be rebuilt from storage.
pub struct IdentityIndex {
    conn: Mutex<Connection>,
}

impl IdentityIndex {
    pub fn open_at_root<P: AsRef<Path>>(data_root: P) -> Result<Self> {
        let db_path = data_root.as_ref().join(META_DIR).join(IDENTITY_DB);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS identity_index (
                dataset    TEXT NOT NULL,
                identity   TEXT NOT NULL,
                partition  TEXT NOT NULL,
                PRIMARY KEY (dataset, identity, partition)
            );
            CREATE INDEX IF NOT EXISTS identity_by_partition
                ON identity_index (dataset, partition);
            CREATE TABLE IF NOT EXISTS partition_digest (
                dataset    TEXT NOT NULL,
                partition  TEXT NOT NULL,
                digest     TEXT NOT NULL,
                PRIMARY KEY (dataset, partition)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CurateError::Config("identity index lock poisoned".to_string()))
    }

    /// Every committed identity of `dataset` with the partitions holding it,
    /// partition names in sort order.
    pub fn holders(&self, dataset: &str) -> Result<HashMap<IdentityKey, BTreeSet<String>>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT identity, partition FROM identity_index WHERE dataset = ?1")?;
        let rows = stmt.query_map(params![dataset], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut holders: HashMap<IdentityKey, BTreeSet<String>> = HashMap::new();
        for row in rows {
            let (identity, partition) = row?;
            holders
                .entry(IdentityKey::from_stored(identity))
                .or_default()
                .insert(partition);
        }
        Ok(holders)
    }

    /// Keys of the current commit of `partition`.
    pub fn keys_in(&self, dataset: &str, partition: &PartitionKey) -> Result<HashSet<IdentityKey>> {
        self.query_keys(
            "SELECT identity FROM identity_index WHERE dataset = ?1 AND partition = ?2",
            dataset,
            partition,
        )
    }

    fn query_keys(&self, sql: &str, dataset: &str, partition: &PartitionKey) -> Result<HashSet<IdentityKey>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![dataset, partition.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut keys = HashSet::new();
        for row in rows {
            keys.insert(IdentityKey::from_stored(row?));
        }
        Ok(keys)
    }

    /// Replace the key set of one partition in a single transaction.
    pub fn replace_partition(
        &self,
        dataset: &str,
        partition: &PartitionKey,
        keys: &[IdentityKey],
        digest: &str,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM identity_index WHERE dataset = ?1 AND partition = ?2",
            params![dataset, partition.as_str()],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO identity_index (dataset, identity, partition) VALUES (?1, ?2, ?3)",
            )?;
            for key in keys {
                insert.execute(params![dataset, key.as_str(), partition.as_str()])?;
            }
        }
        tx.execute(
            "INSERT INTO partition_digest (dataset, partition, digest) VALUES (?1, ?2, ?3)
             ON CONFLICT(dataset, partition) DO UPDATE SET digest=excluded.digest",
            params![dataset, partition.as_str(), digest],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn partition_digest(&self, dataset: &str, partition: &PartitionKey) -> Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT digest FROM partition_digest WHERE dataset = ?1 AND partition = ?2")?;
        let mut rows = stmt.query(params![dataset, partition.as_str()])?;
        if let Some(row) = rows.next()? {
            let digest: String = row.get(0)?;
            Ok(Some(digest))
        } else {
            Ok(None)
        }
    }

    /// Partitions the index knows about for `dataset`.
    pub fn indexed_partitions(&self, dataset: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT partition FROM partition_digest WHERE dataset = ?1 ORDER BY partition")?;
        let rows = stmt.query_map(params![dataset], |row| row.get::<_, String>(0))?;
        let mut partitions = Vec::new();
        for row in rows {
            partitions.push(row?);
        }
        Ok(partitions)
    }

    pub fn forget_partition(&self, dataset: &str, partition: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM identity_index WHERE dataset = ?1 AND partition = ?2",
            params![dataset, partition],
        )?;
        conn.execute(
            "DELETE FROM partition_digest WHERE dataset = ?1 AND partition = ?2",
            params![dataset, partition],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> IdentityKey {
        IdentityKey::from_stored(s)
    }

    #[test]
    fn test_holders_list_every_partition_of_an_identity() {
        let index = IdentityIndex::open_in_memory().unwrap();
        let p1 = PartitionKey::new("2024-03-15").unwrap();
        let p2 = PartitionKey::new("2024-03-16").unwrap();
        index.replace_partition("Sales", &p2, &[key("b"), key("c")], "sha256:2").unwrap();
        index.replace_partition("Sales", &p1, &[key("a"), key("b")], "sha256:1").unwrap();

        let holders = index.holders("Sales").unwrap();
        assert_eq!(holders.len(), 3);
        let of_b: Vec<&str> = holders[&key("b")].iter().map(String::as_str).collect();
        assert_eq!(of_b, vec!["2024-03-15", "2024-03-16"]);
        assert_eq!(index.keys_in("Sales", &p2).unwrap().len(), 2);
        assert!(index.holders("Calendar").unwrap().is_empty());
    }

    #[test]
    fn test_replace_partition_swaps_key_set_and_digest() {
        let index = IdentityIndex::open_in_memory().unwrap();
        let p1 = PartitionKey::new("2024-03-15").unwrap();
        index.replace_partition("Sales", &p1, &[key("a")], "sha256:1").unwrap();
        index.replace_partition("Sales", &p1, &[key("z")], "sha256:9").unwrap();

        let in_p1 = index.keys_in("Sales", &p1).unwrap();
        assert!(in_p1.contains(&key("z")));
        assert!(!in_p1.contains(&key("a")));
        let holders = index.holders("Sales").unwrap();
        assert!(holders.contains_key(&key("z")));
        assert!(!holders.contains_key(&key("a")));
        assert_eq!(
            index.partition_digest("Sales", &p1).unwrap().as_deref(),
            Some("sha256:9")
        );
    }

    #[test]
    fn test_index_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = PartitionKey::new("2024-03-15").unwrap();
        {
            let index = IdentityIndex::open_at_root(dir.path()).unwrap();
            index.replace_partition("Sales", &p1, &[key("a")], "sha256:1").unwrap();
        }
        let reopened = IdentityIndex::open_at_root(dir.path()).unwrap();
        assert_eq!(reopened.indexed_partitions("Sales").unwrap(), vec!["2024-03-15"]);
        reopened.forget_partition("Sales", "2024-03-15").unwrap();
        assert!(reopened.indexed_partitions("Sales").unwrap().is_empty());
    }
}
