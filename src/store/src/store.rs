use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use redb::{Database, ReadableTable, TableDefinition};

use super::{codec::Codec, error::Error};

const TOMBSTONE_SUFFIX: &str = ".deleted";
const TIMESTAMP_LEN: usize = 8;

pub fn open_database(path: impl AsRef<Path>) -> Result<Arc<Database>, Error> {
    let db = Database::create(path)?;
    Ok(Arc::new(db))
}

/// A record removed by [`DiskStore::delete`], kept until purged.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone<T> {
    pub key: String,
    pub deleted_at: DateTime<Utc>,
    pub value: T,
}

/// Key-value store backed by one redb table and mirrored in memory.
///
/// Writes go to disk first and only then to the in-memory index, so the index
/// never holds anything the table does not. Reads are served from memory.
/// The index is rebuilt from the table every time the store is opened.
pub struct DiskStore<T> {
    db: Arc<Database>,
    name: String,
    tombstone: String,
    codec: Box<dyn Codec<T>>,
    cache: RwLock<HashMap<String, T>>,
}

impl<T> std::fmt::Debug for DiskStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore").field("name", &self.name).finish()
    }
}

impl<T: Clone> DiskStore<T> {
    pub fn new(
        db: Arc<Database>,
        name: &str,
        codec: impl Codec<T> + 'static,
    ) -> Result<DiskStore<T>, Error> {
        let store = DiskStore {
            db,
            name: name.to_string(),
            tombstone: format!("{name}{TOMBSTONE_SUFFIX}"),
            codec: Box::new(codec),
            cache: RwLock::new(HashMap::new()),
        };

        // Make sure both tables exist so that readers never see TableDoesNotExist.
        let txn = store.db.begin_write()?;
        {
            txn.open_table(store.table())?;
            txn.open_table(store.tombstone_table())?;
        }
        txn.commit()?;

        store.load()?;
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.name)
    }

    fn tombstone_table(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.tombstone)
    }

    fn load(&self) -> Result<(), Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.table())?;
        let mut entries = HashMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let decoded = self.codec.decode(value.value())?;
            entries.insert(key.value().to_string(), decoded);
        }

        tracing::debug!(store = self.name, records = entries.len(), "Load store");

        let mut cache = self.cache.write().map_err(|_| Error::Lock)?;
        *cache = entries;
        Ok(())
    }

    pub fn put(&self, key: &str, value: T) -> Result<(), Error> {
        let bytes = self.codec.encode(&value)?;

        // Holding the index lock across the commit keeps disk and memory in the same order.
        let mut cache = self.cache.write().map_err(|_| Error::Lock)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(self.table())?;
            table.insert(key, bytes.as_slice())?;
            let mut tombstones = txn.open_table(self.tombstone_table())?;
            tombstones.remove(key)?;
        }
        txn.commit()?;

        cache.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<T, Error> {
        let cache = self.cache.read().map_err(|_| Error::Lock)?;
        cache
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> Result<bool, Error> {
        let cache = self.cache.read().map_err(|_| Error::Lock)?;
        Ok(cache.contains_key(key))
    }

    pub fn list(&self) -> Result<Vec<T>, Error> {
        let cache = self.cache.read().map_err(|_| Error::Lock)?;
        Ok(cache.values().cloned().collect())
    }

    pub fn entries(&self) -> Result<Vec<(String, T)>, Error> {
        let cache = self.cache.read().map_err(|_| Error::Lock)?;
        Ok(cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn len(&self) -> Result<usize, Error> {
        let cache = self.cache.read().map_err(|_| Error::Lock)?;
        Ok(cache.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Remove `key`, keeping the last value as a tombstone.
    /// Deleting a missing key succeeds without touching the tombstones.
    pub fn delete(&self, key: &str) -> Result<(), Error> {
        let mut cache = self.cache.write().map_err(|_| Error::Lock)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(self.table())?;
            let removed = table.remove(key)?.map(|v| v.value().to_vec());
            if let Some(bytes) = removed {
                let mut tombstones = txn.open_table(self.tombstone_table())?;
                let record = encode_tombstone(Utc::now(), &bytes);
                tombstones.insert(key, record.as_slice())?;
            }
        }
        txn.commit()?;

        cache.remove(key);
        Ok(())
    }

    pub fn tombstones(&self) -> Result<Vec<Tombstone<T>>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.tombstone_table())?;
        let mut res = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let key = key.value().to_string();
            let (deleted_at, bytes) = decode_tombstone(&key, value.value())?;
            res.push(Tombstone {
                value: self.codec.decode(bytes)?,
                key,
                deleted_at,
            });
        }
        Ok(res)
    }

    /// Drop tombstones older than `grace`. Returns how many were removed.
    pub fn purge_tombstones(&self, grace: Duration) -> Result<usize, Error> {
        let deadline = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let txn = self.db.begin_write()?;
        let purged = {
            let mut table = txn.open_table(self.tombstone_table())?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let key = key.value().to_string();
                let (deleted_at, _) = decode_tombstone(&key, value.value())?;
                if deleted_at <= deadline {
                    expired.push(key);
                }
            }
            for key in expired.iter() {
                table.remove(key.as_str())?;
            }
            expired.len()
        };
        txn.commit()?;

        if purged > 0 {
            tracing::debug!(store = self.name, purged, "Purge tombstones");
        }
        Ok(purged)
    }
}

fn encode_tombstone(deleted_at: DateTime<Utc>, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TIMESTAMP_LEN + value.len());
    buf.extend_from_slice(&deleted_at.timestamp_millis().to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

fn decode_tombstone<'a>(key: &str, buf: &'a [u8]) -> Result<(DateTime<Utc>, &'a [u8]), Error> {
    if buf.len() < TIMESTAMP_LEN {
        return Err(Error::CorruptedTombstone(key.to_string()));
    }
    let (ts, value) = buf.split_at(TIMESTAMP_LEN);
    let mut millis = [0u8; TIMESTAMP_LEN];
    millis.copy_from_slice(ts);
    let deleted_at = Utc
        .timestamp_millis_opt(i64::from_be_bytes(millis))
        .single()
        .ok_or_else(|| Error::CorruptedTombstone(key.to_string()))?;
    Ok((deleted_at, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FnCodec, JsonCodec};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Record {
        owner: String,
        interface: String,
    }

    fn record(owner: &str) -> Record {
        Record {
            owner: owner.to_string(),
            interface: "eth0".to_string(),
        }
    }

    #[test]
    fn works_put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("store.db")).unwrap();
        let store = DiskStore::<Record>::new(db, "net1", JsonCodec).unwrap();

        store.put("10.0.0.1", record("a")).unwrap();
        store.put("10.0.0.2", record("b")).unwrap();
        assert_eq!(store.get("10.0.0.1").unwrap(), record("a"));
        assert_eq!(store.len().unwrap(), 2);

        store.put("10.0.0.1", record("c")).unwrap();
        assert_eq!(store.get("10.0.0.1").unwrap(), record("c"));

        store.delete("10.0.0.1").unwrap();
        assert!(matches!(store.get("10.0.0.1"), Err(Error::NotFound(_))));
        assert_eq!(store.list().unwrap(), vec![record("b")]);

        // deleting again is fine
        store.delete("10.0.0.1").unwrap();
    }

    #[test]
    fn works_reopen_reproduces_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let mut before = {
            let db = open_database(&path).unwrap();
            let store = DiskStore::<Record>::new(db, "net1", JsonCodec).unwrap();
            store.put("10.0.0.1", record("a")).unwrap();
            store.put("10.0.0.2", record("b")).unwrap();
            store.put("10.0.0.3", record("c")).unwrap();
            store.delete("10.0.0.2").unwrap();
            store.entries().unwrap()
        };

        let db = open_database(&path).unwrap();
        let store = DiskStore::<Record>::new(db, "net1", JsonCodec).unwrap();
        let mut after = store.entries().unwrap();
        before.sort_by(|a, b| a.0.cmp(&b.0));
        after.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(before, after);
    }

    #[test]
    fn works_tables_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("store.db")).unwrap();
        let a = DiskStore::<Record>::new(db.clone(), "net-a", JsonCodec).unwrap();
        let b = DiskStore::<Record>::new(db, "net-b", JsonCodec).unwrap();

        a.put("10.0.0.1", record("a")).unwrap();
        assert!(b.is_empty().unwrap());
        assert!(matches!(b.get("10.0.0.1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn works_tombstones_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("store.db")).unwrap();
        let store = DiskStore::<Record>::new(db, "net1", JsonCodec).unwrap();

        store.put("pod-a", record("a")).unwrap();
        store.delete("pod-a").unwrap();

        let tombstones = store.tombstones().unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].key, "pod-a");
        assert_eq!(tombstones[0].value, record("a"));

        assert_eq!(store.purge_tombstones(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.purge_tombstones(Duration::ZERO).unwrap(), 1);
        assert!(store.tombstones().unwrap().is_empty());
    }

    #[test]
    fn works_put_clears_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("store.db")).unwrap();
        let store = DiskStore::<Record>::new(db, "net1", JsonCodec).unwrap();

        store.put("pod-a", record("a")).unwrap();
        store.delete("pod-a").unwrap();
        store.put("pod-a", record("b")).unwrap();
        assert!(store.tombstones().unwrap().is_empty());
    }

    #[test]
    fn fails_put_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("store.db")).unwrap();
        let codec = FnCodec::new(
            |v: &Record| {
                if v.owner == "poison" {
                    return Err(Error::Codec("refused".into()));
                }
                serde_json::to_vec(v).map_err(|e| Error::Codec(Box::new(e)))
            },
            |b: &[u8]| serde_json::from_slice(b).map_err(|e| Error::Codec(Box::new(e))),
        );
        let store = DiskStore::<Record>::new(db, "net1", codec).unwrap();

        store.put("10.0.0.1", record("a")).unwrap();
        assert!(matches!(
            store.put("10.0.0.1", record("poison")),
            Err(Error::Codec(_))
        ));
        assert_eq!(store.get("10.0.0.1").unwrap(), record("a"));
    }
}
