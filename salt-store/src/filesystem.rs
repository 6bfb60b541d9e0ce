//! Salt store persisted as a single JSON document on local disk.
//!
//! The document maps the key string to `{salt, created_at}`. Writes go through
//! one store-wide queue and replace the file with an atomic rename, so readers
//! only ever see a complete document.
use crate::inflight::InflightCreates;
use crate::{SaltGenerator, SaltKey, SaltRecord, SaltStore, SaltStoreError, read_or_create};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

type Document = BTreeMap<String, SaltRecord>;

pub struct FilesystemSaltStore {
    path: PathBuf,
    tmp_path: PathBuf,
    // Serializes every read-modify-write cycle on the file. tokio's mutex is
    // FIFO, so mutations are applied in arrival order.
    write_queue: Mutex<()>,
    inflight: InflightCreates,
}

impl FilesystemSaltStore {
    pub fn new(base_dir: &str, filename: &str) -> Self {
        let path = Path::new(base_dir).join(filename);
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");

        FilesystemSaltStore {
            path,
            tmp_path: tmp_path.into(),
            write_queue: Mutex::new(()),
            inflight: InflightCreates::default(),
        }
    }

    async fn load(&self) -> Result<Document, SaltStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Document::new());
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn store(&self, document: &Document) -> Result<(), SaltStoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;

        let mut file = tokio::fs::File::create(&self.tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        tracing::debug!(path = ?self.path, records = document.len(), "Stored salts");
        Ok(())
    }

    /// Runs `f` against the current document while holding the write queue.
    /// The document is written back only when `f` reports a change.
    async fn mutate<T, F>(&self, f: F) -> Result<T, SaltStoreError>
    where
        F: FnOnce(&mut Document) -> Result<(T, bool), SaltStoreError> + Send,
        T: Send,
    {
        let _turn = self.write_queue.lock().await;

        let mut document = self.load().await?;
        let (output, changed) = f(&mut document)?;
        if changed {
            self.store(&document).await?;
        }

        Ok(output)
    }
}

#[async_trait]
impl SaltStore for FilesystemSaltStore {
    async fn get(&self, key: &SaltKey) -> Result<Option<SaltRecord>, SaltStoreError> {
        let mut document = self.load().await?;
        Ok(document.remove(&key.to_string()))
    }

    async fn set(&self, key: &SaltKey, record: SaltRecord) -> Result<(), SaltStoreError> {
        self.mutate(|document| match document.entry(key.to_string()) {
            Entry::Occupied(_) => Err(SaltStoreError::AlreadyExists(key.clone())),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(((), true))
            }
        })
        .await
    }

    async fn get_all(&self) -> Result<BTreeMap<SaltKey, SaltRecord>, SaltStoreError> {
        let document = self.load().await?;

        let mut records = BTreeMap::new();
        for (raw_key, record) in document {
            match raw_key.parse::<SaltKey>() {
                Ok(key) => {
                    records.insert(key, record);
                }
                Err(e) => tracing::warn!(error = %e, path = ?self.path, "Skipping entry"),
            }
        }

        Ok(records)
    }

    async fn delete(&self, key: &SaltKey) -> Result<bool, SaltStoreError> {
        self.mutate(|document| {
            let removed = document.remove(&key.to_string()).is_some();
            Ok((removed, removed))
        })
        .await
    }

    async fn get_or_create(
        &self,
        key: &SaltKey,
        generate: SaltGenerator,
    ) -> Result<SaltRecord, SaltStoreError> {
        if let Some(record) = self.get(key).await? {
            return Ok(record);
        }

        self.inflight
            .run(key, || read_or_create(self, key, generate))
            .await
    }

    async fn cleanup_before(&self, date: NaiveDate) -> Result<usize, SaltStoreError> {
        self.mutate(|document| {
            let before = document.len();
            // Entries that do not parse as keys are not ours to remove
            document.retain(|raw_key, _| {
                raw_key
                    .parse::<SaltKey>()
                    .map(|key| key.date() >= date)
                    .unwrap_or(true)
            });
            let removed = before - document.len();
            Ok((removed, removed > 0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn get_store() -> (tempfile::TempDir, FilesystemSaltStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemSaltStore::new(dir.path().to_str().unwrap(), "salts.json");
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let (_dir, store) = get_store();
        let key = SaltKey::new(date(1), "site");

        assert_eq!(store.get(&key).await.unwrap(), None);
        assert!(store.get_all().await.unwrap().is_empty());
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_format() {
        let (dir, store) = get_store();
        let key = SaltKey::new(date(1), "site");
        store.set(&key, SaltRecord::new("abc")).await.unwrap();

        let raw = std::fs::read(dir.path().join("salts.json")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["salt:2024-05-01:site"]["salt"], "abc");
        assert!(json["salt:2024-05-01:site"]["created_at"].is_string());

        // No temporary file is left behind
        assert!(!dir.path().join("salts.json.tmp").exists());

        // A second store over the same file sees the record
        let reopened = FilesystemSaltStore::new(dir.path().to_str().unwrap(), "salts.json");
        assert_eq!(reopened.get(&key).await.unwrap().unwrap().salt, "abc");
    }

    #[tokio::test]
    async fn test_set_rejects_existing_key() {
        let (_dir, store) = get_store();
        let key = SaltKey::new(date(1), "site");

        store.set(&key, SaltRecord::new("first")).await.unwrap();
        assert!(matches!(
            store.set(&key, SaltRecord::new("second")).await,
            Err(SaltStoreError::AlreadyExists(_))
        ));
        assert_eq!(store.get(&key).await.unwrap().unwrap().salt, "first");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_not_overwritten() {
        let (dir, store) = get_store();
        let path = dir.path().join("salts.json");
        std::fs::write(&path, b"{not json").unwrap();

        let key = SaltKey::new(date(1), "site");
        assert!(matches!(
            store.set(&key, SaltRecord::new("abc")).await,
            Err(SaltStoreError::Json(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"{not json");
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_lose_updates() {
        let (_dir, store) = get_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let key = SaltKey::new(date(1), format!("site-{i}"));
                store.set(&key, SaltRecord::new(format!("{i}"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get_all().await.unwrap().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create() {
        let (_dir, store) = get_store();
        let store = Arc::new(store);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = SaltKey::new(date(2), "site");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_create(
                        &key,
                        Box::new(move || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            format!("salt-{i}")
                        }),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut salts = Vec::new();
        for handle in handles {
            salts.push(handle.await.unwrap().salt);
        }

        // Every caller sees the salt that ended up on disk
        let stored = store.get(&key).await.unwrap().unwrap();
        assert!(salts.iter().all(|s| s == &stored.salt));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let (_dir, store) = get_store();
        store
            .set(&SaltKey::new(date(1), "a"), SaltRecord::new("1"))
            .await
            .unwrap();
        store
            .set(&SaltKey::new(date(1), "b"), SaltRecord::new("2"))
            .await
            .unwrap();
        store
            .set(&SaltKey::new(date(3), "a"), SaltRecord::new("3"))
            .await
            .unwrap();

        assert_eq!(store.cleanup_before(date(3)).await.unwrap(), 2);
        assert_eq!(store.cleanup_before(date(3)).await.unwrap(), 0);

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&SaltKey::new(date(3), "a")].salt, "3");
    }
}
