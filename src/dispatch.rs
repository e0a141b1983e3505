//! Request dispatch through the route table
//!
//! One handler serves every bound prefix. The prefix is worked out from the
//! request path and looked up fresh on each request, so re-registering a
//! prefix takes effect on the next request without re-binding anything.

use crate::error::ProxyError;
use crate::proxy::{redirect_response, text_response, ProxyBody};
use crate::routes::RouteTable;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Default external mount point for proxied projects
pub const DEFAULT_MOUNT: &str = "/projects";

/// Default time to wait for upstream response headers
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Body prefix of the response for a bound prefix with no live backend
pub const FALLBACK_BODY: &str = "fallback: Path not found";

/// Routes requests under the mount point to live backends
#[derive(Debug, Clone)]
pub struct Dispatcher {
    table: Arc<RouteTable>,
    mount: String,
    upstream_timeout: Duration,
}

impl Dispatcher {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self {
            table,
            mount: DEFAULT_MOUNT.to_string(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    /// Set the external mount point; empty mounts the table at `/`
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// Path as seen by the route table, or `None` if `path` is outside the mount
    pub fn strip_mount<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.mount.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.mount.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Serve one request
    ///
    /// Never fails: unmatched paths, removed routes and upstream errors all
    /// map to a response.
    pub async fn dispatch<B>(
        &self,
        mut req: Request<B>,
        client_addr: SocketAddr,
        is_https: bool,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let Some(path) = self.strip_mount(req.uri().path()).map(str::to_string) else {
            return text_response(StatusCode::NOT_FOUND, "404 page not found");
        };
        let query = req.uri().query().map(str::to_string);

        let Some(prefix) = self.table.match_binding(&path) else {
            let subtree = format!("{}/", path);
            if self.table.is_bound(&subtree) {
                let mut location = format!("{}{}", self.mount, subtree);
                if let Some(q) = &query {
                    location.push('?');
                    location.push_str(q);
                }
                return redirect_response(&location);
            }
            return text_response(StatusCode::NOT_FOUND, "404 page not found");
        };

        let Some(backend) = self.table.lookup(&prefix) else {
            debug!(path = %path, prefix = %prefix, "no live backend, serving fallback");
            return text_response(StatusCode::OK, &format!("{}{}", FALLBACK_BODY, path));
        };

        let inner_uri = match query {
            Some(q) => format!("{}?{}", path, q),
            None => path.clone(),
        };
        match inner_uri.parse::<Uri>() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                warn!(path = %path, "could not rebuild request URI: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        }

        let request_id = match req.headers().get(&X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    req.headers_mut().insert(X_REQUEST_ID, value);
                }
                id
            }
        };

        let span = info_span!(
            "proxy",
            method = %req.method(),
            path = %path,
            backend = backend.name(),
            request_id = %request_id,
        );

        let forwarded = tokio::time::timeout(
            self.upstream_timeout,
            backend.forward(req, client_addr, is_https),
        )
        .instrument(span.clone())
        .await;

        span.in_scope(|| match forwarded {
            Ok(Ok(response)) => {
                debug!(status = %response.status(), "upstream responded");
                response
            }
            Ok(Err(e)) => {
                warn!("upstream error: {}", e);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
            Err(_) => {
                warn!("{}", ProxyError::UpstreamTimeout(self.upstream_timeout));
                text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            }
        })
    }
}
