use serde::Deserialize;
use url::Url;

fn default_pubsub_url() -> Url {
    Url::parse("https://pubsub.googleapis.com").expect("static URL is valid")
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum QueueConfig {
    /// In-process queue. Only meaningful when ingest and worker share a process.
    Memory,
    PubSub(PubSubConfig),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct PubSubConfig {
    pub project_id: String,
    /// Topic the ingest service publishes to
    pub topic: Option<String>,
    /// Subscription the worker pulls from
    pub subscription: Option<String>,
    #[serde(default = "default_pubsub_url")]
    pub base_url: Url,
    pub auth_token: Option<String>,
}
