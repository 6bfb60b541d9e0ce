//! Google Cloud Pub/Sub over its REST API. Works against the emulator by
//! pointing `base_url` at it and leaving `auth_token` unset.
use crate::config::PubSubConfig;
use crate::{AckId, Message, Publisher, QueueError, Subscription};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<OutgoingMessage>,
}

#[derive(Serialize)]
struct OutgoingMessage {
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: IncomingMessage,
}

#[derive(Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [AckId],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [AckId],
    ack_deadline_seconds: u32,
}

/// Builds `{base}/v1/projects/{project}/{collection}/{name}:{method}`.
fn resource_url(
    config: &PubSubConfig,
    collection: &str,
    name: &str,
    method: &str,
) -> Result<Url, QueueError> {
    let mut url = config.base_url.clone();
    url.path_segments_mut()
        .map_err(|_| QueueError::InvalidConfig(format!("{} cannot be a base URL", config.base_url)))?
        .pop_if_empty()
        .extend(["v1", "projects", config.project_id.as_str(), collection])
        .push(&format!("{name}:{method}"));
    Ok(url)
}

#[derive(Clone)]
struct RestClient {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl RestClient {
    fn new(config: &PubSubConfig) -> Self {
        RestClient {
            client: reqwest::Client::new(),
            auth_token: config.auth_token.clone(),
        }
    }

    fn post(&self, url: &Url) -> RequestBuilder {
        let request = self.client.post(url.clone());
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn call<T: Serialize + ?Sized>(
        &self,
        url: &Url,
        body: &T,
    ) -> Result<reqwest::Response, QueueError> {
        let response = self.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(QueueError::UnexpectedStatus(response.status()));
        }
        Ok(response)
    }
}

pub struct PubSubPublisher {
    rest: RestClient,
    publish_url: Url,
}

impl PubSubPublisher {
    pub fn new(config: &PubSubConfig, topic: &str) -> Result<Self, QueueError> {
        Ok(PubSubPublisher {
            rest: RestClient::new(config),
            publish_url: resource_url(config, "topics", topic, "publish")?,
        })
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    async fn publish(&self, data: Bytes) -> Result<(), QueueError> {
        let request = PublishRequest {
            messages: vec![OutgoingMessage {
                data: STANDARD.encode(&data),
            }],
        };
        self.rest.call(&self.publish_url, &request).await?;
        Ok(())
    }
}

pub struct PubSubSubscription {
    rest: RestClient,
    pull_url: Url,
    acknowledge_url: Url,
    modify_ack_deadline_url: Url,
}

impl PubSubSubscription {
    pub fn new(config: &PubSubConfig, subscription: &str) -> Result<Self, QueueError> {
        Ok(PubSubSubscription {
            rest: RestClient::new(config),
            pull_url: resource_url(config, "subscriptions", subscription, "pull")?,
            acknowledge_url: resource_url(config, "subscriptions", subscription, "acknowledge")?,
            modify_ack_deadline_url: resource_url(
                config,
                "subscriptions",
                subscription,
                "modifyAckDeadline",
            )?,
        })
    }
}

#[async_trait]
impl Subscription for PubSubSubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<Message>, QueueError> {
        let response = self
            .rest
            .call(&self.pull_url, &PullRequest { max_messages })
            .await?
            .json::<PullResponse>()
            .await?;

        let mut messages = Vec::with_capacity(response.received_messages.len());
        let mut undecodable = Vec::new();
        for received in response.received_messages {
            match STANDARD.decode(received.message.data.as_bytes()) {
                Ok(data) => messages.push(Message {
                    ack_id: received.ack_id,
                    data: Bytes::from(data),
                }),
                Err(e) => {
                    tracing::warn!(
                        ack_id = %received.ack_id,
                        error = %e,
                        "Message data is not valid base64"
                    );
                    undecodable.push(received.ack_id);
                }
            }
        }

        // Undecodable messages are released now instead of at lease expiry
        if let Err(e) = self.nack(&undecodable).await {
            tracing::error!(
                error = %e,
                count = undecodable.len(),
                "Failed to nack undecodable messages"
            );
        }
        Ok(messages)
    }

    async fn ack(&self, ack_ids: &[AckId]) -> Result<(), QueueError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.rest
            .call(&self.acknowledge_url, &AcknowledgeRequest { ack_ids })
            .await?;
        Ok(())
    }

    async fn nack(&self, ack_ids: &[AckId]) -> Result<(), QueueError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        // A zero deadline makes the messages immediately available for redelivery
        let request = ModifyAckDeadlineRequest {
            ack_ids,
            ack_deadline_seconds: 0,
        };
        self.rest
            .call(&self.modify_ack_deadline_url, &request)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> PubSubConfig {
        PubSubConfig {
            project_id: "analytics".into(),
            topic: Some("hits".into()),
            subscription: Some("hits-worker".into()),
            base_url: Url::parse(&server.uri()).unwrap(),
            auth_token: Some("token".into()),
        }
    }

    #[tokio::test]
    async fn test_publish() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/analytics/topics/hits:publish"))
            .and(header("authorization", "Bearer token"))
            .and(body_json(json!({"messages": [{"data": "aGVsbG8="}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messageIds": ["1"]})))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = PubSubPublisher::new(&config(&server), "hits").unwrap();
        publisher.publish(Bytes::from_static(b"hello")).await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_decodes_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/analytics/subscriptions/hits-worker:pull"))
            .and(body_json(json!({"maxMessages": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "receivedMessages": [
                    {"ackId": "ack-1", "message": {"data": "aGVsbG8=", "messageId": "1"}}
                ]
            })))
            .mount(&server)
            .await;

        let subscription = PubSubSubscription::new(&config(&server), "hits-worker").unwrap();
        let messages = subscription.pull(5).await.unwrap();
        assert_eq!(
            messages,
            vec![Message {
                ack_id: "ack-1".into(),
                data: Bytes::from_static(b"hello"),
            }]
        );
    }

    #[tokio::test]
    async fn test_pull_nacks_undecodable_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/analytics/subscriptions/hits-worker:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "receivedMessages": [
                    {"ackId": "ack-1", "message": {"data": "aGVsbG8="}},
                    {"ackId": "ack-2", "message": {"data": "not base64!"}},
                    {"ackId": "ack-3", "message": {"data": "d29ybGQ="}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(
                "/v1/projects/analytics/subscriptions/hits-worker:modifyAckDeadline",
            ))
            .and(body_json(json!({"ackIds": ["ack-2"], "ackDeadlineSeconds": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let subscription = PubSubSubscription::new(&config(&server), "hits-worker").unwrap();
        let messages = subscription.pull(5).await.unwrap();
        let ack_ids: Vec<_> = messages.iter().map(|m| m.ack_id.as_str()).collect();
        assert_eq!(ack_ids, vec!["ack-1", "ack-3"]);
        assert_eq!(messages[1].data.as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_empty_pull() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/analytics/subscriptions/hits-worker:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let subscription = PubSubSubscription::new(&config(&server), "hits-worker").unwrap();
        assert!(subscription.pull(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_and_nack() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/analytics/subscriptions/hits-worker:acknowledge"))
            .and(body_json(json!({"ackIds": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(
                "/v1/projects/analytics/subscriptions/hits-worker:modifyAckDeadline",
            ))
            .and(body_json(json!({"ackIds": ["c"], "ackDeadlineSeconds": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let subscription = PubSubSubscription::new(&config(&server), "hits-worker").unwrap();
        subscription
            .ack(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        subscription.nack(&["c".to_string()]).await.unwrap();

        // Nothing to settle means no request
        subscription.ack(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let publisher = PubSubPublisher::new(&config(&server), "hits").unwrap();
        assert!(matches!(
            publisher.publish(Bytes::from_static(b"x")).await,
            Err(QueueError::UnexpectedStatus(status)) if status.as_u16() == 503
        ));
    }
}
