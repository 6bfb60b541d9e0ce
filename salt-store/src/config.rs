use serde::Deserialize;
use url::Url;

fn default_filename() -> String {
    "salts.json".into()
}

fn default_database() -> String {
    "(default)".into()
}

fn default_collection() -> String {
    "salts".into()
}

fn default_firestore_url() -> Url {
    Url::parse("https://firestore.googleapis.com").expect("static URL is valid")
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SaltStoreConfig {
    Memory,
    Filesystem {
        base_dir: String,
        #[serde(default = "default_filename")]
        filename: String,
    },
    Firestore(FirestoreConfig),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct FirestoreConfig {
    pub project_id: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Points at the Firestore emulator in development
    #[serde(default = "default_firestore_url")]
    pub base_url: Url,
    /// Sent as a bearer token on every request when present
    pub auth_token: Option<String>,
}
