//! Storage for the per-site, per-day salts that anonymize visitor identity.
//!
//! Salts are keyed by UTC date and site id, so rotation happens implicitly when
//! the date changes. Every backend guarantees that concurrent `get_or_create`
//! callers for the same key all observe the same salt.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

pub mod config;
mod filesystem;
mod firestore;
mod inflight;
mod memory;
pub mod metrics_defs;

pub use filesystem::FilesystemSaltStore;
pub use firestore::FirestoreSaltStore;
pub use memory::MemorySaltStore;

use config::SaltStoreConfig;
use metrics_defs::{SALT_CREATE_RACE_LOST, SALT_CREATED};

const KEY_PREFIX: &str = "salt";

/// Number of random bytes in a generated salt.
pub const SALT_BYTES: usize = 32;

/// Produces the salt value when `get_or_create` has to create a record.
pub type SaltGenerator = Box<dyn FnOnce() -> String + Send>;

#[derive(thiserror::Error, Debug)]
pub enum SaltStoreError {
    #[error("salt already exists for {0}")]
    AlreadyExists(SaltKey),

    #[error("salt for {0} missing after losing the create race")]
    LostRace(SaltKey),

    #[error("invalid salt key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid salt document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("document store returned {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Identifies one salt: a UTC calendar day and a site.
///
/// The string form is `salt:{YYYY-MM-DD}:{site id}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SaltKey {
    date: NaiveDate,
    site_id: String,
}

impl SaltKey {
    pub fn new(date: NaiveDate, site_id: impl Into<String>) -> Self {
        SaltKey {
            date,
            site_id: site_id.into(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }
}

impl fmt::Display for SaltKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{KEY_PREFIX}:{}:{}",
            self.date.format("%Y-%m-%d"),
            self.site_id
        )
    }
}

impl FromStr for SaltKey {
    type Err = SaltStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SaltStoreError::InvalidKey(s.to_string());

        let rest = s
            .strip_prefix(KEY_PREFIX)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(invalid)?;
        // The site id may itself contain ':', the date never does
        let (date, site_id) = rest.split_once(':').ok_or_else(invalid)?;
        if site_id.is_empty() {
            return Err(invalid());
        }
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;

        Ok(SaltKey::new(date, site_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltRecord {
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

impl SaltRecord {
    pub fn new(salt: impl Into<String>) -> Self {
        SaltRecord {
            salt: salt.into(),
            created_at: Utc::now(),
        }
    }
}

/// 32 bytes from the OS random source, hex encoded.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[async_trait]
pub trait SaltStore: Send + Sync {
    async fn get(&self, key: &SaltKey) -> Result<Option<SaltRecord>, SaltStoreError>;

    /// Stores a new record. Fails with `AlreadyExists` if the key is taken.
    async fn set(&self, key: &SaltKey, record: SaltRecord) -> Result<(), SaltStoreError>;

    async fn get_all(&self) -> Result<BTreeMap<SaltKey, SaltRecord>, SaltStoreError>;

    /// Returns true if a record was removed.
    async fn delete(&self, key: &SaltKey) -> Result<bool, SaltStoreError>;

    /// Returns the stored record for `key`, creating it with `generate` if
    /// there is none. A lost creation race is resolved by returning the
    /// winner's record.
    async fn get_or_create(
        &self,
        key: &SaltKey,
        generate: SaltGenerator,
    ) -> Result<SaltRecord, SaltStoreError>;

    /// Removes every record dated strictly before `date`. Returns the number
    /// of removed records.
    async fn cleanup_before(&self, date: NaiveDate) -> Result<usize, SaltStoreError>;

    /// Removes every record dated before the current UTC day.
    async fn cleanup(&self) -> Result<usize, SaltStoreError> {
        self.cleanup_before(Utc::now().date_naive()).await
    }
}

/// Read first, then attempt an atomic create. If the create loses the race,
/// the winner's record is read back and returned instead.
pub(crate) async fn read_or_create<S>(
    store: &S,
    key: &SaltKey,
    generate: SaltGenerator,
) -> Result<SaltRecord, SaltStoreError>
where
    S: SaltStore + ?Sized,
{
    if let Some(record) = store.get(key).await? {
        return Ok(record);
    }

    let record = SaltRecord::new(generate());
    match store.set(key, record.clone()).await {
        Ok(()) => {
            counter!(SALT_CREATED).increment(1);
            tracing::debug!(key = %key, "Created salt");
            Ok(record)
        }
        Err(SaltStoreError::AlreadyExists(_)) => {
            counter!(SALT_CREATE_RACE_LOST).increment(1);
            tracing::debug!(key = %key, "Lost salt creation race, reading winner");
            store
                .get(key)
                .await?
                .ok_or_else(|| SaltStoreError::LostRace(key.clone()))
        }
        Err(e) => Err(e),
    }
}

/// Builds the configured backend.
pub async fn get_store(config: &SaltStoreConfig) -> Result<Arc<dyn SaltStore>, SaltStoreError> {
    let store: Arc<dyn SaltStore> = match config {
        SaltStoreConfig::Memory => {
            tracing::warn!("Salts are kept in memory and are lost on restart");
            Arc::new(MemorySaltStore::new())
        }
        SaltStoreConfig::Filesystem { base_dir, filename } => {
            tokio::fs::create_dir_all(base_dir).await?;
            Arc::new(FilesystemSaltStore::new(base_dir, filename))
        }
        SaltStoreConfig::Firestore(firestore_config) => {
            Arc::new(FirestoreSaltStore::new(firestore_config)?)
        }
    };

    Ok(store)
}
