use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::{Service, service_fn};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    pub port: u16,
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("Port cannot be 0")]
pub struct InvalidPort;

impl Listener {
    pub fn validate(&self) -> Result<(), InvalidPort> {
        if self.port == 0 {
            return Err(InvalidPort);
        }
        Ok(())
    }
}

/// Address of the TCP peer that sent a request. Inserted into the request
/// extensions of every request served by `run_http_service`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Accepts connections on `host:port` and serves them with `service` until
/// `shutdown` is cancelled. Connections that are already open are left to
/// finish on their own.
pub async fn run_http_service<S, E>(
    host: &str,
    port: u16,
    service: S,
    shutdown: CancellationToken,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "Listening");

    let service_arc = Arc::new(service);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(host, port, "Listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();
        let svc = service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(PeerAddr(peer_addr));
            svc.call(req)
        });

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(error = %e, "Connection closed with error");
            }
        });
    }
}

/// Wraps a static or owned payload into a boxed body.
pub fn full_body<E>(bytes: impl Into<Bytes>) -> BoxBody<Bytes, E> {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Builds a plain text response with the lowercase canonical reason as body,
/// e.g. `unauthorized\n` for 401.
pub fn make_boxed_error_response<E>(status: StatusCode) -> Response<BoxBody<Bytes, E>> {
    let reason = status
        .canonical_reason()
        .unwrap_or("error")
        .to_ascii_lowercase();

    let mut response = Response::new(full_body(format!("{reason}\n")));
    *response.status_mut() = status;
    response
}
