use crate::inflight::InflightCreates;
use crate::{SaltGenerator, SaltKey, SaltRecord, SaltStore, SaltStoreError, read_or_create};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Process-local salt store. Suitable for a single instance and for tests,
/// salts do not survive a restart.
#[derive(Default)]
pub struct MemorySaltStore {
    records: Mutex<HashMap<SaltKey, SaltRecord>>,
    inflight: InflightCreates,
}

impl MemorySaltStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SaltStore for MemorySaltStore {
    async fn get(&self, key: &SaltKey) -> Result<Option<SaltRecord>, SaltStoreError> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn set(&self, key: &SaltKey, record: SaltRecord) -> Result<(), SaltStoreError> {
        match self.records.lock().entry(key.clone()) {
            Entry::Occupied(_) => Err(SaltStoreError::AlreadyExists(key.clone())),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }

    async fn get_all(&self) -> Result<BTreeMap<SaltKey, SaltRecord>, SaltStoreError> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    async fn delete(&self, key: &SaltKey) -> Result<bool, SaltStoreError> {
        Ok(self.records.lock().remove(key).is_some())
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
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|key, _| key.date() >= date);
        Ok(before - records.len())
    }
}
