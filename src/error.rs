//! Error types shared by the route table, the forwarder and the certificate store

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the proxy core
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Path prefix was empty or did not start with `/`
    #[error("invalid path prefix: {0:?}")]
    InvalidPathPrefix(String),

    /// Backend URL could not be used as an upstream target
    #[error("invalid target URL {url:?}: {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    /// Certificate or key file could not be read or decoded
    #[error("failed to load certificate from {path}: {reason}")]
    CertificateLoad { path: String, reason: String },

    /// Leaf certificate could not be parsed for a hostname
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("no certificate available")]
    NoCertificateAvailable,

    /// TLS configuration rejected by rustls
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// Upstream connection or protocol failure
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// Upstream did not answer in time
    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub(crate) fn invalid_url(url: &str, reason: impl ToString) -> Self {
        Self::InvalidTargetUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn cert_load(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::CertificateLoad {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias using ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::invalid_url("--calhost-:=-8080/", "relative URL without a base");
        assert!(err.to_string().contains("--calhost-:=-8080/"));

        let err = ProxyError::cert_load(std::path::Path::new("/tmp/missing.pem"), "not found");
        assert!(err.to_string().contains("/tmp/missing.pem"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
