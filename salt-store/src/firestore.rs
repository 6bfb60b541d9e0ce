//! Salt store backed by Firestore documents, accessed over the REST API.
//!
//! Each salt is one document in the configured collection, named by the key
//! string. Creation uses `createDocument`, which fails with 409 when the
//! document already exists; that is the atomic create-if-absent the store
//! relies on.
use crate::config::FirestoreConfig;
use crate::{SaltGenerator, SaltKey, SaltRecord, SaltStore, SaltStoreError, read_or_create};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

const PAGE_SIZE: &str = "300";

#[derive(Serialize, Deserialize, Debug)]
struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    fields: DocumentFields,
}

#[derive(Serialize, Deserialize, Debug)]
struct DocumentFields {
    salt: StringValue,
    created_at: TimestampValue,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StringValue {
    string_value: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TimestampValue {
    timestamp_value: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<Document>,
    next_page_token: Option<String>,
}

impl From<&SaltRecord> for Document {
    fn from(record: &SaltRecord) -> Self {
        Document {
            name: None,
            fields: DocumentFields {
                salt: StringValue {
                    string_value: record.salt.clone(),
                },
                created_at: TimestampValue {
                    timestamp_value: record.created_at,
                },
            },
        }
    }
}

impl From<Document> for SaltRecord {
    fn from(document: Document) -> Self {
        SaltRecord {
            salt: document.fields.salt.string_value,
            created_at: document.fields.created_at.timestamp_value,
        }
    }
}

pub struct FirestoreSaltStore {
    client: reqwest::Client,
    collection_url: Url,
    auth_token: Option<String>,
}

impl FirestoreSaltStore {
    pub fn new(config: &FirestoreConfig) -> Result<Self, SaltStoreError> {
        let mut collection_url = config.base_url.clone();
        collection_url
            .path_segments_mut()
            .map_err(|_| {
                SaltStoreError::InvalidConfig(format!("{} cannot be a base URL", config.base_url))
            })?
            .pop_if_empty()
            .extend([
                "v1",
                "projects",
                config.project_id.as_str(),
                "databases",
                config.database.as_str(),
                "documents",
                config.collection.as_str(),
            ]);

        Ok(FirestoreSaltStore {
            client: reqwest::Client::new(),
            collection_url,
            auth_token: config.auth_token.clone(),
        })
    }

    fn document_url(&self, key: &SaltKey) -> Url {
        let mut url = self.collection_url.clone();
        // Checked in new(): the collection URL always has path segments
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(&key.to_string());
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SaltStore for FirestoreSaltStore {
    async fn get(&self, key: &SaltKey) -> Result<Option<SaltRecord>, SaltStoreError> {
        let response = self
            .authorize(self.client.get(self.document_url(key)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let document = response.json::<Document>().await?;
                Ok(Some(document.into()))
            }
            status => Err(SaltStoreError::UnexpectedStatus(status)),
        }
    }

    async fn set(&self, key: &SaltKey, record: SaltRecord) -> Result<(), SaltStoreError> {
        let response = self
            .authorize(self.client.post(self.collection_url.clone()))
            .query(&[("documentId", key.to_string())])
            .json(&Document::from(&record))
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Err(SaltStoreError::AlreadyExists(key.clone())),
            status if status.is_success() => Ok(()),
            status => Err(SaltStoreError::UnexpectedStatus(status)),
        }
    }

    async fn get_all(&self) -> Result<BTreeMap<SaltKey, SaltRecord>, SaltStoreError> {
        let mut records = BTreeMap::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .authorize(self.client.get(self.collection_url.clone()))
                .query(&[("pageSize", PAGE_SIZE)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(SaltStoreError::UnexpectedStatus(response.status()));
            }
            let page = response.json::<ListDocumentsResponse>().await?;

            for document in page.documents {
                let key = document
                    .name
                    .as_deref()
                    .and_then(|name| name.rsplit('/').next())
                    .map(str::parse::<SaltKey>);

                match key {
                    Some(Ok(key)) => {
                        records.insert(key, document.into());
                    }
                    _ => tracing::warn!(name = ?document.name, "Skipping document"),
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(records)
    }

    async fn delete(&self, key: &SaltKey) -> Result<bool, SaltStoreError> {
        // Without the precondition a delete of a missing document also succeeds
        let response = self
            .authorize(self.client.delete(self.document_url(key)))
            .query(&[("currentDocument.exists", "true")])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SaltStoreError::UnexpectedStatus(status)),
        }
    }

    async fn get_or_create(
        &self,
        key: &SaltKey,
        generate: SaltGenerator,
    ) -> Result<SaltRecord, SaltStoreError> {
        read_or_create(self, key, generate).await
    }

    async fn cleanup_before(&self, date: NaiveDate) -> Result<usize, SaltStoreError> {
        let mut removed = 0;
        for key in self.get_all().await?.into_keys() {
            if key.date() < date && self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
