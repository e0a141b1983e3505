//! Proxy server implementation
//! Serves HTTP and HTTPS, hands mounted paths to the dispatcher

use crate::certificate::CertificateStore;
use crate::dispatch::Dispatcher;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Response body type used throughout the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Smallest header buffer hyper accepts
const MIN_HEADER_BYTES: usize = 8192;

/// Headers added to every response the proxy serves
const SECURITY_HEADERS: [(&str, &str); 6] = [
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("content-security-policy", "default-src 'self'"),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains; preload",
    ),
];

/// Proxy server configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind_address: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub force_https: bool,
    pub header_read_timeout: Duration,
    pub max_header_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 8080,
            https_port: 8443,
            enable_https: false,
            force_https: false,
            header_read_timeout: Duration::from_secs(5),
            max_header_bytes: 1 << 20,
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    dispatcher: Dispatcher,
    certificates: Option<Arc<CertificateStore>>,
}

impl ProxyServer {
    /// Create a new proxy server
    ///
    /// `certificates` is required when `config.enable_https` is set.
    pub fn new(
        config: ProxyConfig,
        dispatcher: Dispatcher,
        certificates: Option<Arc<CertificateStore>>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            certificates,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Bind the listeners and serve until an accept loop fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http_addr = SocketAddr::new(self.config.bind_address, self.config.http_port);
        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", http_addr))?;
        info!("HTTP server listening on {}", http_addr);

        if !self.config.enable_https {
            return self.serve_http(http_listener).await;
        }

        let certificates = self
            .certificates
            .clone()
            .ok_or_else(|| anyhow!("HTTPS enabled without a certificate store"))?;
        let acceptor = TlsAcceptor::from(certificates.server_config()?);

        let https_addr = SocketAddr::new(self.config.bind_address, self.config.https_port);
        let https_listener = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("failed to bind HTTPS listener on {}", https_addr))?;
        info!("HTTPS server listening on {}", https_addr);

        tokio::try_join!(
            self.clone().serve_http(http_listener),
            self.clone().serve_https(https_listener, acceptor),
        )?;
        Ok(())
    }

    /// Accept plain HTTP connections
    async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, remote_addr, false).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Accept TLS connections, the certificate chosen by SNI
    async fn serve_https(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("TLS handshake failed from {}: {}", remote_addr, e);
                        return;
                    }
                };
                if let Err(e) = server.serve_connection(tls_stream, remote_addr, true).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single connection
    async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        is_https: bool,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.header_read_timeout)
            .max_buf_size(self.config.max_header_bytes.max(MIN_HEADER_BYTES))
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move {
                        Ok::<_, Infallible>(server.handle_request(req, remote_addr, is_https).await)
                    }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_https: bool,
    ) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        debug!("{} {} from {}", req.method(), path, remote_addr);

        let mut response = if path == "/health" {
            text_response(StatusCode::OK, "OK")
        } else if self.config.force_https && !is_https && !Self::is_https_request(&req) {
            self.https_redirect(&req)
        } else if self.dispatcher.strip_mount(&path).is_some() {
            self.dispatcher.dispatch(req, remote_addr, is_https).await
        } else {
            text_response(StatusCode::NOT_FOUND, "404 page not found")
        };

        apply_security_headers(response.headers_mut());
        response
    }

    /// Redirect a plain HTTP request to the HTTPS listener
    fn https_redirect<T>(&self, req: &Request<T>) -> Response<ProxyBody> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string());

        let Some(host) = host else {
            return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
        };

        let authority = if self.config.https_port == 443 {
            host
        } else {
            format!("{}:{}", host, self.config.https_port)
        };
        let location = format!(
            "https://{}{}",
            authority,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        redirect_response(&location)
    }

    /// Check if request is from HTTPS (via proxy headers)
    fn is_https_request<T>(req: &Request<T>) -> bool {
        let header_is = |name: &str, expected: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        };

        header_is("x-forwarded-proto", "https")
            || header_is("x-forwarded-ssl", "on")
            || header_is("front-end-https", "on")
    }
}

/// Add the security headers the upstream did not already set
fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        if !headers.contains_key(name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
}

/// Create text response
pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create redirect response
pub(crate) fn redirect_response(location: &str) -> Response<ProxyBody> {
    let Ok(location) = HeaderValue::from_str(location) else {
        warn!("refusing redirect to unencodable location {:?}", location);
        return text_response(StatusCode::BAD_REQUEST, "Bad Request");
    };

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    response.headers_mut().insert(LOCATION, location);
    response
}

/// Create full body
pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::RouteTable;

    fn server(config: ProxyConfig) -> ProxyServer {
        ProxyServer::new(config, Dispatcher::new(Arc::new(RouteTable::new())), None)
    }

    #[test]
    fn test_security_headers_do_not_override_upstream() {
        let mut headers = HeaderMap::new();
        headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));

        apply_security_headers(&mut headers);

        assert_eq!(headers.get("x-frame-options").unwrap(), "SAMEORIGIN");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.len(), SECURITY_HEADERS.len());
    }

    #[test]
    fn test_is_https_request() {
        let req = Request::builder()
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();
        assert!(ProxyServer::is_https_request(&req));

        let req = Request::builder().header("front-end-https", "on").body(()).unwrap();
        assert!(ProxyServer::is_https_request(&req));

        let req = Request::builder().body(()).unwrap();
        assert!(!ProxyServer::is_https_request(&req));
    }

    #[test]
    fn test_https_redirect() {
        let proxy = server(ProxyConfig {
            force_https: true,
            ..ProxyConfig::default()
        });
        let req = Request::builder()
            .uri("/projects/svc/?a=1")
            .header(HOST, "example.com:8080")
            .body(())
            .unwrap();

        let response = proxy.https_redirect(&req);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://example.com:8443/projects/svc/?a=1"
        );

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(proxy.https_redirect(&req).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_redirect_rejects_bad_location() {
        let response = redirect_response("/bad\nlocation");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
