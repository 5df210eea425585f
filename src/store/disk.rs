//! The embedded on-disk store.

use camino::Utf8Path;

use super::StoreError;

//----------- DiskStore --------------------------------------------------------

/// A file-backed key-value store.
///
/// Writes land in sled's page cache and are made durable by [`save()`];
/// the database serializes concurrent access internally.
///
/// [`save()`]: Self::save()
#[derive(Clone, Debug)]
pub struct DiskStore {
    /// The open database.
    db: sled::Db,
}

impl DiskStore {
    /// Open (or create) the database at a path.
    pub fn open(path: &Utf8Path) -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::open(path.as_std_path())?,
        })
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .get(key)?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    /// Create or overwrite a key.
    pub fn update(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.insert(key, value.as_bytes())?;
        Ok(())
    }

    /// Delete a key.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    /// Flush all pending writes to disk.
    pub async fn save(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Visit every entry and collect the keys accepted by the predicate.
    pub fn scan<F>(&self, pred: F) -> Result<Vec<String>, StoreError>
    where
        F: Fn(&str, &str) -> bool,
    {
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            let value = String::from_utf8_lossy(&value);
            if pred(&key, &value) {
                keys.push(key.into_owned());
            }
        }
        Ok(keys)
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::DiskStore;

    fn open_temp() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("db");
        let store = DiskStore::open(&path).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn get_update_delete() {
        let (_dir, store) = open_temp();

        assert_eq!(store.get("k").unwrap(), None);
        store.update("k", "0,1000").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("0,1000"));

        store.update("k", "1,1070").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("1,1070"));

        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        // Deleting an absent key is a success.
        store.delete("k").unwrap();
        store.save().await.unwrap();
    }

    #[test]
    fn scan_filters_on_key_and_value() {
        let (_dir, store) = open_temp();
        store.update("a", "0,100").unwrap();
        store.update("b", "0,2000").unwrap();
        store.update("c", "3,150").unwrap();

        let mut old = store
            .scan(|_, value| {
                super::super::Entry::parse(value).is_some_and(|entry| entry.last_seen < 1000)
            })
            .unwrap();
        old.sort();
        assert_eq!(old, ["a", "c"]);
    }
}
