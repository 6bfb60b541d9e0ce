//! Daily rotating visitor identifiers.
//!
//! The identifier is `hex(SHA-256(salt || site_id || client_ip || user_agent))`
//! with the four fields concatenated in that order and no delimiter. The salt
//! is per site and per UTC day, so the identifier is stable for one visitor
//! within a day and unlinkable across days once old salts are deleted.
use chrono::{DateTime, Utc};
use salt_store::{SaltKey, SaltStore, SaltStoreError, generate_salt};
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Clone)]
pub struct SessionSignatureGenerator {
    store: Arc<dyn SaltStore>,
    salt_generator: fn() -> String,
}

impl SessionSignatureGenerator {
    pub fn new(store: Arc<dyn SaltStore>) -> Self {
        Self::with_salt_generator(store, generate_salt)
    }

    pub fn with_salt_generator(store: Arc<dyn SaltStore>, salt_generator: fn() -> String) -> Self {
        SessionSignatureGenerator {
            store,
            salt_generator,
        }
    }

    pub async fn generate(
        &self,
        site_id: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> Result<String, SaltStoreError> {
        self.generate_at(site_id, client_ip, user_agent, Utc::now())
            .await
    }

    pub async fn generate_at(
        &self,
        site_id: &str,
        client_ip: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> Result<String, SaltStoreError> {
        let key = SaltKey::new(now.date_naive(), site_id);
        let record = self
            .store
            .get_or_create(&key, Box::new(self.salt_generator))
            .await?;

        Ok(session_digest(&record.salt, site_id, client_ip, user_agent))
    }
}

pub fn session_digest(salt: &str, site_id: &str, client_ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(site_id.as_bytes());
    hasher.update(client_ip.as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use salt_store::MemorySaltStore;

    fn generator() -> SessionSignatureGenerator {
        SessionSignatureGenerator::new(Arc::new(MemorySaltStore::new()))
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn test_known_salt() {
        let generator = SessionSignatureGenerator::with_salt_generator(
            Arc::new(MemorySaltStore::new()),
            || "deadbeef".to_string(),
        );

        let signature = generator
            .generate_at("S", "1.2.3.4", "UA-X", at(12, 0, 0))
            .await
            .unwrap();
        assert_eq!(
            signature,
            "479dbf55b2c9743c994e1ed35a2c8e080445fef5b012fa88957b7b57f854977b"
        );
        assert_eq!(signature, session_digest("deadbeef", "S", "1.2.3.4", "UA-X"));
    }

    #[tokio::test]
    async fn test_stable_within_day() {
        let generator = generator();
        let morning = generator
            .generate_at("site", "10.0.0.1", "Mozilla/5.0", at(0, 0, 1))
            .await
            .unwrap();
        let evening = generator
            .generate_at("site", "10.0.0.1", "Mozilla/5.0", at(23, 59, 59))
            .await
            .unwrap();

        assert_eq!(morning, evening);
        assert_eq!(morning.len(), 64);
        assert!(morning.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_any_input_change_changes_signature() {
        let generator = generator();
        let now = at(9, 30, 0);
        let base = generator
            .generate_at("site", "10.0.0.1", "UA", now)
            .await
            .unwrap();

        for (site, ip, ua) in [
            ("site2", "10.0.0.1", "UA"),
            ("site", "10.0.0.2", "UA"),
            ("site", "10.0.0.1", "UA2"),
        ] {
            let other = generator.generate_at(site, ip, ua, now).await.unwrap();
            assert_ne!(base, other, "{site} {ip} {ua}");
        }
    }

    #[tokio::test]
    async fn test_rotates_at_utc_midnight() {
        let generator = generator();
        let before = generator
            .generate_at("site", "10.0.0.1", "UA", at(23, 59, 59))
            .await
            .unwrap();
        let after = generator
            .generate_at(
                "site",
                "10.0.0.1",
                "UA",
                Utc.with_ymd_and_hms(2024, 5, 18, 0, 0, 0).unwrap(),
            )
            .await
            .unwrap();

        assert_ne!(before, after);
    }
}
