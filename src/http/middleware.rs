//! Admission control middleware.
//!
//! Tower layer that applies per-client rate limits to any HTTP service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::ratelimit::{Admission, AdmissionControl};

const TOO_MANY_REQUESTS_BODY: &str = "429 Too Many Requests";
const BAD_REQUEST_BODY: &str = "400 Bad Request";

/// Raw remote address of a request's peer.
///
/// Transports that do not provide `ConnectInfo<SocketAddr>` can insert this
/// extension instead; when both are present this one wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Admission control middleware layer
#[derive(Clone)]
pub struct AdmissionLayer {
    control: Arc<AdmissionControl>,
}

impl AdmissionLayer {
    /// Create a new admission layer
    pub fn new(control: Arc<AdmissionControl>) -> Self {
        Self { control }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            control: self.control.clone(),
        }
    }
}

/// Admission control middleware service
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    control: Arc<AdmissionControl>,
}

impl<S, B> Service<Request<B>> for AdmissionService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let remote_addr = remote_addr(&req);

        match self.control.check(req.headers(), remote_addr.as_deref()) {
            Ok(Admission::Admitted { .. }) => {
                // Call the instance that was driven to readiness
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { inner.call(req).await })
            }
            Ok(Admission::Rejected { retry_after, .. }) => {
                let response = too_many_requests(retry_after.as_secs_f64());
                Box::pin(async move { Ok(response) })
            }
            Err(error) => {
                warn!(
                    error = %error,
                    method = %req.method(),
                    uri = %req.uri(),
                    "Rate limiter could not identify client"
                );
                let response = (StatusCode::BAD_REQUEST, BAD_REQUEST_BODY).into_response();
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// The peer address string for a request, if the transport provided one.
fn remote_addr<B>(req: &Request<B>) -> Option<String> {
    if let Some(RemoteAddr(addr)) = req.extensions().get::<RemoteAddr>() {
        return Some(addr.clone());
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
}

/// Build a 429 response advising the client when to retry.
fn too_many_requests(retry_after_secs: f64) -> Response {
    let seconds = retry_after_secs.ceil().max(1.0) as u64;
    debug!(retry_after = seconds, "Rejecting request");

    let mut response = (StatusCode::TOO_MANY_REQUESTS, TOO_MANY_REQUESTS_BODY).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    response
}
