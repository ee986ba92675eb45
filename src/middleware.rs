//! Tower middleware that puts an [`AdmissionControl`] in front of an HTTP service.
//!
//! The layer pulls the client address and API key out of each request, asks
//! the limiter, and either forwards the request or answers it directly:
//!
//! | outcome | response |
//! |---|---|
//! | admitted | inner response + `X-RateLimit-Limit` / `X-RateLimit-Remaining` |
//! | `BudgetExceeded` | 429 with `Retry-After` |
//! | `InvalidIdentity`, `UnknownApiKey` | 400 |
//! | `StoreUnavailable` | 500, or pass-through under [`StoreFailurePolicy::FailOpen`] |

use crate::engine::AdmissionControl;
use crate::error::LimitError;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{Extensions, HeaderMap, Request, Response, StatusCode};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Header carrying the API key unless overridden.
pub const DEFAULT_API_KEY_HEADER: &str = "api_key";
/// Reverse-proxy supplied client address.
pub const X_REAL_IP: &str = "x-real-ip";
/// Proxy chain; the first entry is the originating client.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// What to do when the limiter's store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    /// Reject with 500.
    #[default]
    FailClosed,
    /// Let the request through unmetered.
    FailOpen,
}

/// Looks up the connection's peer address in request extensions.
pub type PeerAddrFn = fn(&Extensions) -> Option<SocketAddr>;

fn socket_addr_extension(extensions: &Extensions) -> Option<SocketAddr> {
    extensions.get::<SocketAddr>().copied()
}

/// HTTP status for a limiter error.
pub fn status_for(err: &LimitError) -> StatusCode {
    match err {
        LimitError::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        LimitError::InvalidIdentity | LimitError::UnknownApiKey => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Best-effort client address: `X-Real-Ip`, then `X-Forwarded-For`, then the
/// peer address. Port suffixes are removed. Returns an empty string when
/// nothing usable is present.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(ip) = header_str(headers, X_REAL_IP) {
        return strip_port(ip);
    }
    if let Some(first) = header_str(headers, X_FORWARDED_FOR).and_then(|v| v.split(',').next()) {
        let first = first.trim();
        if !first.is_empty() {
            return strip_port(first);
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

/// Remove a `:port` suffix, leaving bare IPv6 addresses alone.
pub fn strip_port(raw: &str) -> String {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return ip.to_string();
    }
    match raw.rsplit_once(':') {
        // host:port with a non-IP host
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host.to_string(),
        _ => raw.to_string(),
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// A layer that enforces admission control using an [`AdmissionControl`].
#[derive(Debug)]
pub struct AdmissionLayer<L> {
    limiter: Arc<L>,
    api_key_header: HeaderName,
    on_store_failure: StoreFailurePolicy,
    peer_addr: PeerAddrFn,
}

impl<L> Clone for AdmissionLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            api_key_header: self.api_key_header.clone(),
            on_store_failure: self.on_store_failure,
            peer_addr: self.peer_addr,
        }
    }
}

impl<L> AdmissionLayer<L> {
    /// Create a new admission layer.
    pub fn new(limiter: L) -> Self {
        Self::from_arc(Arc::new(limiter))
    }

    /// Create a layer around an already shared limiter.
    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            api_key_header: HeaderName::from_static(DEFAULT_API_KEY_HEADER),
            on_store_failure: StoreFailurePolicy::default(),
            peer_addr: socket_addr_extension,
        }
    }

    /// Read the API key from a different header.
    pub fn with_api_key_header(mut self, header: HeaderName) -> Self {
        self.api_key_header = header;
        self
    }

    /// Choose fail-open or fail-closed on store outages.
    pub fn with_store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_store_failure = policy;
        self
    }

    /// Override how the peer address is found (e.g. a framework's connect-info extension).
    pub fn with_peer_addr(mut self, lookup: PeerAddrFn) -> Self {
        self.peer_addr = lookup;
        self
    }
}

impl<S, L> Layer<S> for AdmissionLayer<L>
where
    L: AdmissionControl + 'static,
{
    type Service = AdmissionService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, layer: self.clone() }
    }
}

/// Middleware service that enforces admission control.
#[derive(Debug)]
pub struct AdmissionService<S, L> {
    inner: S,
    layer: AdmissionLayer<L>,
}

impl<S: Clone, L> Clone for AdmissionService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: AdmissionControl + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.layer.limiter.clone();
        let on_store_failure = self.layer.on_store_failure;
        let mut inner = self.inner.clone();

        let peer = (self.layer.peer_addr)(req.extensions());
        let client = client_address(req.headers(), peer);
        let api_key = req
            .headers()
            .get(&self.layer.api_key_header)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        Box::pin(async move {
            match limiter.allow_request(&client, &api_key).await {
                Ok(admission) => {
                    let mut response = inner.call(req).await?;
                    let headers = response.headers_mut();
                    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(admission.max_requests));
                    headers
                        .insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(admission.remaining()));
                    Ok(response)
                }
                Err(err) if err.is_store_unavailable() && on_store_failure == StoreFailurePolicy::FailOpen => {
                    tracing::warn!(
                        target: "gatekeep::middleware",
                        client = %client,
                        error = %err,
                        "limiter store unavailable; failing open"
                    );
                    inner.call(req).await
                }
                Err(err) => {
                    if err.is_store_unavailable() {
                        tracing::warn!(
                            target: "gatekeep::middleware",
                            client = %client,
                            error = %err,
                            "limiter store unavailable; rejecting request"
                        );
                    } else {
                        tracing::debug!(client = %client, api_key_present = !api_key.is_empty(), error = %err, "request rejected");
                    }
                    Ok(reject(&err))
                }
            }
        })
    }
}

fn reject<B: From<String>>(err: &LimitError) -> Response<B> {
    let mut response = Response::new(B::from(err.to_string()));
    *response.status_mut() = status_for(err);
    if let Some(wait) = err.retry_after() {
        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
    }
    response
}
