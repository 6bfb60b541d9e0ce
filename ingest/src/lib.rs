//! HTTP ingress for page hits.
//!
//! Authenticates the request, captures the client identity, and publishes the
//! raw event to the queue without waiting for the outcome. Enrichment and
//! delivery happen in the worker.
pub mod auth;
pub mod config;
pub mod errors;
mod identity;
pub mod metrics_defs;

pub use errors::IngestError;

use auth::RequestAuthenticator;
use chrono::Utc;
use config::IngestConfig;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use metrics_defs::{
    EVENTS_ACCEPTED, PUBLISH_FAILURES, REQUEST_DURATION, REQUESTS_INFLIGHT,
};
use queue::Publisher;
use serde::Deserialize;
use shared::admin_service::AdminService;
use shared::event::RawEvent;
use shared::http::{PeerAddr, full_body, make_boxed_error_response, run_http_service};
use shared::{counter, gauge, histogram};
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The client supplied part of an event.
#[derive(Deserialize)]
struct ClientEvent {
    site_id: String,
    hostname: String,
    pathname: String,
    #[serde(default)]
    referrer: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    screen_width: Option<u32>,
}

pub async fn run(
    config: IngestConfig,
    publisher: Arc<dyn Publisher>,
    shutdown: CancellationToken,
) -> Result<(), IngestError> {
    config.validate()?;

    let ready = Arc::new(AtomicBool::new(true));
    let admin_task = config.admin_listener.clone().map(|listener| {
        let service = AdminService::<IngestError>::new(ready.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_http_service(&listener.host, listener.port, service, shutdown).await
        })
    });

    let service = IngestService::new(&config, publisher);
    let publishes = service.publishes();
    tracing::info!(
        event_path = %config.event_path,
        auth_enabled = config.auth.secret.is_some(),
        "Ingest service started"
    );

    let result =
        run_http_service(&config.listener.host, config.listener.port, service, shutdown).await;
    ready.store(false, Ordering::Relaxed);

    if let Err(e) = result {
        if let Some(task) = admin_task {
            task.abort();
        }
        return Err(e);
    }

    // Events already accepted are still published
    publishes.close();
    publishes.wait().await;
    tracing::info!("Ingest service stopped");

    if let Some(task) = admin_task {
        task.await??;
    }
    Ok(())
}

pub struct IngestService {
    inner: Arc<Inner>,
}

struct Inner {
    authenticator: RequestAuthenticator,
    publisher: Arc<dyn Publisher>,
    event_path: String,
    loopback_path: Option<String>,
    trust_forwarded_for: bool,
    max_body_bytes: usize,
    publishes: TaskTracker,
}

impl IngestService {
    pub fn new(config: &IngestConfig, publisher: Arc<dyn Publisher>) -> Self {
        IngestService {
            inner: Arc::new(Inner {
                authenticator: RequestAuthenticator::new(&config.auth),
                publisher,
                event_path: config.event_path.clone(),
                loopback_path: config.auth.loopback_path.clone(),
                trust_forwarded_for: config.trust_forwarded_for,
                max_body_bytes: config.max_body_bytes,
                publishes: TaskTracker::new(),
            }),
        }
    }

    /// Tracks the publish tasks spawned for accepted events.
    pub fn publishes(&self) -> TaskTracker {
        self.inner.publishes.clone()
    }
}

impl Service<Request<Incoming>> for IngestService {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = IngestError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.serve(req).await) })
    }
}

impl Inner {
    async fn serve<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, IngestError>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let started = Instant::now();
        gauge!(REQUESTS_INFLIGHT).increment(1.0);

        let response = match self.handle(req).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    tracing::error!(error = %e, "Request failed");
                } else {
                    tracing::debug!(error = %e, status = status.as_u16(), "Request rejected");
                }
                make_boxed_error_response(status)
            }
        };

        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
        histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_string())
            .record(started.elapsed().as_secs_f64());
        response
    }

    async fn handle<B>(&self, req: Request<B>) -> Result<Response<BoxBody<Bytes, IngestError>>, IngestError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let path = req.uri().path();
        if path != self.event_path && self.loopback_path.as_deref() != Some(path) {
            return Err(IngestError::NotFound);
        }
        if req.method() != Method::POST {
            return Err(IngestError::MethodNotAllowed);
        }

        let context = self.authenticator.validate(req.method(), req.uri())?;
        if !self.authenticator.permits(&context) {
            return Err(IngestError::Unauthorized);
        }

        let declared_len = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > self.max_body_bytes) {
            return Err(IngestError::BodyTooLarge {
                limit: self.max_body_bytes,
            });
        }

        let user_agent = identity::user_agent(req.headers());
        let client_ip = identity::client_ip(
            req.headers(),
            req.extensions().get::<PeerAddr>(),
            self.trust_forwarded_for,
        );

        let body = read_body(req.into_body(), self.max_body_bytes).await?;
        let event: ClientEvent = serde_json::from_slice(&body)
            .map_err(|e| IngestError::InvalidEvent(e.to_string()))?;

        let raw = RawEvent {
            site_id: event.site_id,
            hostname: event.hostname,
            pathname: event.pathname,
            referrer: event.referrer,
            title: event.title,
            screen_width: event.screen_width,
            user_agent,
            client_ip,
            received_at: Utc::now(),
        };
        raw.validate()?;
        let payload = Bytes::from(serde_json::to_vec(&raw)?);

        counter!(EVENTS_ACCEPTED).increment(1);
        tracing::debug!(site_id = %raw.site_id, url = %context.cleaned_url, "Accepted event");

        let publisher = self.publisher.clone();
        self.publishes.spawn(async move {
            if let Err(e) = publisher.publish(payload).await {
                counter!(PUBLISH_FAILURES).increment(1);
                tracing::error!(error = %e, "Failed to publish event");
            }
        });

        let mut response = Response::new(full_body(Bytes::new()));
        *response.status_mut() = StatusCode::ACCEPTED;
        Ok(response)
    }
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, IngestError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(IngestError::BodyTooLarge { limit }),
        Err(e) => Err(IngestError::RequestBody(e.to_string())),
    }
}
