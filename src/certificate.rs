//! Certificate store for SNI-based certificate selection
//! Holds one certificate per hostname and hot-reloads from a fixed PEM pair

use crate::error::{ProxyError, Result};
use parking_lot::{Mutex, RwLock};
use rustls::crypto::ring::{self, cipher_suite};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::{version, ServerConfig, SignatureScheme};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

/// Signed with a freshly loaded key to check it belongs to the leaf
const PAIR_CHECK_MESSAGE: &[u8] = b"edgeproxy certificate/key pair check";

/// Hostname -> certificate map with a fixed reload source
///
/// Readers take a shared lock only for the map lookup. File I/O and parsing
/// happen before the write lock is taken, so a reload never blocks handshakes
/// for longer than one map insert.
pub struct CertificateStore {
    certificates: RwLock<BTreeMap<String, Arc<CertifiedKey>>>,
    cert_file: PathBuf,
    key_file: PathBuf,
    reload_lock: Mutex<()>,
}

impl CertificateStore {
    /// Create a store from an initial certificate/key pair
    ///
    /// Fails if the pair cannot be loaded; there is no usable store without one.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(cert_file: P, key_file: Q) -> Result<Self> {
        let store = Self {
            certificates: RwLock::new(BTreeMap::new()),
            cert_file: cert_file.as_ref().to_path_buf(),
            key_file: key_file.as_ref().to_path_buf(),
            reload_lock: Mutex::new(()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Certificate for `hostname`, or the default one when nothing matches
    ///
    /// The default is the certificate with the lowest-sorted hostname.
    pub fn resolve(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        let certificates = self.certificates.read();
        if !hostname.is_empty() {
            if let Some(key) = certificates.get(&hostname.to_ascii_lowercase()) {
                return Ok(key.clone());
            }
        }
        certificates
            .values()
            .next()
            .cloned()
            .ok_or(ProxyError::NoCertificateAvailable)
    }

    /// Re-read the configured pair and replace the entry for its hostname
    ///
    /// On failure the store is left as it was. Returns the hostname loaded.
    pub fn reload(&self) -> Result<String> {
        let _reloading = self.reload_lock.lock();
        let (hostname, key) = load_pair(&self.cert_file, &self.key_file)?;
        self.certificates.write().insert(hostname.clone(), key);
        info!(hostname = %hostname, cert = %self.cert_file.display(), "certificate loaded");
        Ok(hostname)
    }

    /// Load an extra pair alongside the configured one
    ///
    /// Only `reload` re-reads the configured pair; pairs added here stay until
    /// replaced by another certificate for the same hostname.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(&self, cert_file: P, key_file: Q) -> Result<String> {
        let (hostname, key) = load_pair(cert_file.as_ref(), key_file.as_ref())?;
        self.certificates.write().insert(hostname.clone(), key);
        info!(hostname = %hostname, cert = %cert_file.as_ref().display(), "certificate loaded");
        Ok(hostname)
    }

    /// Loaded hostnames in sorted order
    pub fn hostnames(&self) -> Vec<String> {
        self.certificates.read().keys().cloned().collect()
    }

    pub fn cert_file(&self) -> &Path {
        &self.cert_file
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    /// TLS server configuration resolving certificates through this store
    ///
    /// TLS 1.2 and 1.3 only; TLS 1.2 is limited to ECDHE with AES-GCM.
    pub fn server_config(self: &Arc<Self>) -> Result<Arc<ServerConfig>> {
        let provider = CryptoProvider {
            cipher_suites: vec![
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            ],
            ..ring::default_provider()
        };

        let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&version::TLS13, &version::TLS12])?
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let requested = client_hello.server_name().unwrap_or("");
        match CertificateStore::resolve(self, requested) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(sni = %requested, "handshake without certificate: {}", e);
                None
            }
        }
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("hostnames", &self.hostnames())
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .finish()
    }
}

/// Read and decode a PEM pair, returning the leaf hostname and signing key
fn load_pair(cert_file: &Path, key_file: &Path) -> Result<(String, Arc<CertifiedKey>)> {
    let cert_pem = fs::read(cert_file).map_err(|e| ProxyError::cert_load(cert_file, e))?;
    let key_pem = fs::read(key_file).map_err(|e| ProxyError::cert_load(key_file, e))?;

    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ProxyError::cert_load(cert_file, e))?;
    let leaf = chain
        .first()
        .ok_or_else(|| ProxyError::cert_load(cert_file, "no certificate found"))?;

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ProxyError::cert_load(key_file, e))?
        .ok_or_else(|| ProxyError::cert_load(key_file, "no private key found"))?;
    let signing_key =
        ring::sign::any_supported_type(&key).map_err(|e| ProxyError::cert_load(key_file, e))?;

    let hostname = {
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| ProxyError::CertificateParse(e.to_string()))?;
        ensure_key_matches(&cert.public_key().subject_public_key.data, &*signing_key)
            .map_err(|reason| ProxyError::cert_load(key_file, reason))?;
        leaf_hostname(&cert)?
    };

    Ok((hostname, Arc::new(CertifiedKey::new(chain, signing_key))))
}

/// Fail unless signatures from `signing_key` verify against the leaf's public key
///
/// Catches a key file rotated without its certificate (or the reverse)
/// before the pair can replace a working one.
fn ensure_key_matches(
    leaf_public_key: &[u8],
    signing_key: &dyn SigningKey,
) -> std::result::Result<(), String> {
    let algorithms = ring::default_provider().signature_verification_algorithms;
    let offered: Vec<SignatureScheme> = algorithms.mapping.iter().map(|(scheme, _)| *scheme).collect();

    let signer = signing_key
        .choose_scheme(&offered)
        .ok_or_else(|| "private key supports no usable signature scheme".to_string())?;
    let signature = signer.sign(PAIR_CHECK_MESSAGE).map_err(|e| e.to_string())?;

    let matches = algorithms
        .mapping
        .iter()
        .filter(|(scheme, _)| *scheme == signer.scheme())
        .flat_map(|(_, verifiers)| verifiers.iter())
        .any(|verifier| {
            verifier
                .verify_signature(leaf_public_key, PAIR_CHECK_MESSAGE, &signature)
                .is_ok()
        });

    if matches {
        Ok(())
    } else {
        Err("private key does not match certificate".to_string())
    }
}

/// First DNS subject alternative name, else the subject common name
fn leaf_hostname(cert: &X509Certificate<'_>) -> Result<String> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| ProxyError::CertificateParse(e.to_string()))?
        .and_then(|ext| {
            ext.value.general_names.iter().find_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
        });

    let hostname = match san {
        Some(name) => name,
        None => cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .filter(|cn| !cn.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::CertificateParse("certificate names no DNS SAN or common name".to_string())
            })?,
    };

    Ok(hostname.to_ascii_lowercase())
}

/// Write a self-signed certificate and key for `hostnames`
pub fn generate_self_signed<P: AsRef<Path>, Q: AsRef<Path>>(
    hostnames: &[String],
    cert_file: P,
    key_file: Q,
) -> Result<()> {
    let cert_file = cert_file.as_ref();
    let key_file = key_file.as_ref();

    let cert = rcgen::generate_simple_self_signed(hostnames.to_vec())
        .map_err(|e| ProxyError::cert_load(cert_file, e))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| ProxyError::cert_load(cert_file, e))?;
    let key_pem = cert.serialize_private_key_pem();

    for path in [cert_file, key_file] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(cert_file, cert_pem)?;
    fs::write(key_file, key_pem)?;

    info!(hostnames = ?hostnames, cert = %cert_file.display(), "generated self-signed certificate");

    Ok(())
}
