use crate::http::{full_body, make_boxed_error_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Liveness and readiness endpoints served on the admin listener.
///
/// `/health` always answers once the process is serving. `/ready` follows the
/// shared flag, which the owning component flips once it can take traffic and
/// clears again when it starts draining.
pub struct AdminService<E> {
    ready: Arc<AtomicBool>,
    _error: PhantomData<fn() -> E>,
}

impl<E> AdminService<E> {
    pub fn new(ready: Arc<AtomicBool>) -> Self {
        Self {
            ready,
            _error: PhantomData,
        }
    }
}

impl<E> Service<Request<Incoming>> for AdminService<E>
where
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let is_ready = self.ready.load(Ordering::Relaxed);

        Box::pin(async move { Ok(admin_response(req.method(), req.uri().path(), is_ready)) })
    }
}

fn admin_response<E>(method: &Method, path: &str, is_ready: bool) -> Response<BoxBody<Bytes, E>> {
    if method != Method::GET && method != Method::HEAD {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    match path {
        "/health" => Response::new(full_body("ok\n")),
        "/ready" if is_ready => Response::new(full_body("ok\n")),
        "/ready" => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_admin_routes() {
        let ok = admin_response::<Infallible>(&Method::GET, "/health", false);
        assert_eq!(ok.status(), StatusCode::OK);

        // Readiness follows the flag
        let not_ready = admin_response::<Infallible>(&Method::GET, "/ready", false);
        assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);
        let ready = admin_response::<Infallible>(&Method::GET, "/ready", true);
        assert_eq!(ready.status(), StatusCode::OK);

        let missing = admin_response::<Infallible>(&Method::GET, "/metrics", true);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let post = admin_response::<Infallible>(&Method::POST, "/health", true);
        assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
