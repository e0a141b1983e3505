//! Upstream backend descriptors and request forwarding
//!
//! A [`Backend`] is immutable once built. Changing where a prefix points means
//! registering a new `Backend` for it in the route table.

use crate::error::{ProxyError, Result};
use crate::proxy::ProxyBody;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;
use url::Url;

/// Pooled client used to reach upstreams over HTTP or HTTPS
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

static SHARED_CLIENT: Lazy<UpstreamClient> = Lazy::new(upstream_client);

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that only make sense for a single connection
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Build a fresh upstream client
pub fn upstream_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new()).build(HttpsConnector::new())
}

/// One upstream target addressed by a path prefix
#[derive(Clone, Serialize)]
pub struct Backend {
    name: String,
    #[serde(rename = "path")]
    path_prefix: String,
    url: String,
    #[serde(skip)]
    target: Url,
    #[serde(skip)]
    host_header: HeaderValue,
    #[serde(skip)]
    client: UpstreamClient,
}

impl Backend {
    /// Create a backend that forwards through the process-wide client
    pub fn new(
        name: impl Into<String>,
        path_prefix: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<Self> {
        Self::with_client(name, path_prefix, url, SHARED_CLIENT.clone())
    }

    /// Create a backend that forwards through `client`
    pub fn with_client(
        name: impl Into<String>,
        path_prefix: impl Into<String>,
        url: impl Into<String>,
        client: UpstreamClient,
    ) -> Result<Self> {
        let path_prefix = path_prefix.into();
        if path_prefix.is_empty() || !path_prefix.starts_with('/') {
            return Err(ProxyError::InvalidPathPrefix(path_prefix));
        }

        let url = url.into();
        let target = Url::parse(&url).map_err(|e| ProxyError::invalid_url(&url, e))?;
        if target.scheme() != "http" && target.scheme() != "https" {
            return Err(ProxyError::invalid_url(
                &url,
                format!("unsupported scheme {:?}", target.scheme()),
            ));
        }
        let host = target
            .host_str()
            .ok_or_else(|| ProxyError::invalid_url(&url, "missing host"))?;
        let authority = match target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let host_header =
            HeaderValue::from_str(&authority).map_err(|e| ProxyError::invalid_url(&url, e))?;

        Ok(Self {
            name: name.into(),
            path_prefix,
            url,
            target,
            host_header,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// The URL as given at construction
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Relay `req` to this backend and hand back its response
    ///
    /// The response body is streamed, not buffered. Dropping the returned
    /// future aborts the upstream request.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
        is_https: bool,
    ) -> Result<Response<ProxyBody>>
    where
        B: hyper::body::Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let (mut parts, body) = req.into_parts();

        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        parts.uri = self.upstream_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;
        debug!(backend = %self.name, uri = %parts.uri, "forwarding upstream");

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(HOST, self.host_header.clone());

        let client_ip = client_addr.ip().to_string();
        let forwarded_for = match parts
            .headers
            .get(&X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = original_host {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
        parts.headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if is_https { "https" } else { "http" }),
        );

        let upstream_req = Request::from_parts(parts, body.boxed());
        let response = self.client.request(upstream_req).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Point `uri` at the target: scheme and authority replaced, paths joined
    /// with a single slash, queries concatenated
    fn upstream_uri(&self, uri: &Uri) -> Result<Uri> {
        let path = join_paths(self.target.path(), uri.path());

        let query = match (
            self.target.query().filter(|q| !q.is_empty()),
            uri.query().filter(|q| !q.is_empty()),
        ) {
            (Some(base), Some(extra)) => Some(format!("{}&{}", base, extra)),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(extra)) => Some(extra.to_string()),
            (None, None) => None,
        };

        let mut upstream = format!(
            "{}://{}{}",
            self.target.scheme(),
            self.host_header.to_str().unwrap_or_default(),
            path
        );
        if let Some(q) = query {
            upstream.push('?');
            upstream.push_str(&q);
        }

        upstream
            .parse()
            .map_err(|e| ProxyError::invalid_url(&upstream, e))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("path_prefix", &self.path_prefix)
            .field("url", &self.url)
            .finish()
    }
}

/// Join two URL paths so exactly one slash separates them
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    for name in &named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        let err = Backend::new("test", "/test", "--calhost-:=-8080/").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTargetUrl { .. }));
    }

    #[test]
    fn test_non_http_scheme_rejected() {
        let err = Backend::new("test", "/test", "ftp://files.example.com/").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTargetUrl { .. }));

        let err = Backend::new("test", "/test", "mailto:ops@example.com").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTargetUrl { .. }));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        assert!(matches!(
            Backend::new("test", "", "http://localhost:8080/"),
            Err(ProxyError::InvalidPathPrefix(_))
        ));
        assert!(matches!(
            Backend::new("test", "test/", "http://localhost:8080/"),
            Err(ProxyError::InvalidPathPrefix(_))
        ));
    }

    #[test]
    fn test_accessors() {
        let backend = Backend::new("CodeVis", "/wordsweave", "https://words-weave.com/").unwrap();
        assert_eq!(backend.name(), "CodeVis");
        assert_eq!(backend.path_prefix(), "/wordsweave");
        assert_eq!(backend.url(), "https://words-weave.com/");
        assert_eq!(backend.target().host_str(), Some("words-weave.com"));
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/test/"), "/test/");
        assert_eq!(join_paths("/base", "/test"), "/base/test");
        assert_eq!(join_paths("/base/", "test"), "/base/test");
        assert_eq!(join_paths("/base", "test"), "/base/test");
    }

    #[test]
    fn test_upstream_uri() {
        let backend = Backend::new("svc", "/api/", "http://127.0.0.1:9000/v1?key=abc").unwrap();
        let uri: Uri = "/api/users?page=2".parse().unwrap();
        assert_eq!(
            backend.upstream_uri(&uri).unwrap().to_string(),
            "http://127.0.0.1:9000/v1/api/users?key=abc&page=2"
        );

        let backend = Backend::new("svc", "/test/", "http://localhost:8080").unwrap();
        let uri: Uri = "/test/".parse().unwrap();
        assert_eq!(
            backend.upstream_uri(&uri).unwrap().to_string(),
            "http://localhost:8080/test/"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_serialize() {
        let backend = Backend::new("svc", "/svc/", "http://localhost:3000/").unwrap();
        let json = serde_json::to_value(&backend).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "svc", "path": "/svc/", "url": "http://localhost:3000/"})
        );
    }
}
