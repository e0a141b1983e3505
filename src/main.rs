//! EdgeProxy - Main entry point
//!
//! Edge reverse proxy with runtime-managed routes and SNI certificates

use anyhow::{Context, Result};
use clap::Parser;
use edgeproxy::certificate::generate_self_signed;
use edgeproxy::{CertificateStore, Console, Dispatcher, ProxyConfig, ProxyServer, RouteTable};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// A route given on the command line as `NAME,PATH,URL`
#[derive(Debug, Clone)]
struct RouteSpec {
    name: String,
    path: String,
    url: String,
}

impl FromStr for RouteSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ',');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(path), Some(url)) if !name.is_empty() && !path.is_empty() => {
                Ok(Self {
                    name: name.to_string(),
                    path: path.to_string(),
                    url: url.to_string(),
                })
            }
            _ => Err(format!("expected NAME,PATH,URL, got {:?}", s)),
        }
    }
}

/// EdgeProxy - An edge reverse proxy with runtime-managed routes
#[derive(Parser, Debug)]
#[command(name = "edgeproxy")]
#[command(author = "EdgeProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "An edge reverse proxy with runtime-managed routes and SNI certificates")]
struct Args {
    /// Address to bind listeners on
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "8443")]
    https_port: u16,

    /// Enable HTTPS server
    #[arg(long, env = "ENABLE_HTTPS", default_value = "false")]
    enable_https: bool,

    /// Force HTTPS redirect
    #[arg(long, env = "FORCE_HTTPS", default_value = "false")]
    force_https: bool,

    /// Run in production mode (ports 80/443)
    #[arg(long)]
    production: bool,

    /// External mount point for proxied services
    #[arg(long, env = "PROXY_MOUNT", default_value = "/projects")]
    mount: String,

    /// Route to register at startup (repeatable)
    #[arg(long = "route", value_name = "NAME,PATH,URL")]
    routes: Vec<RouteSpec>,

    /// Certificate file (PEM)
    #[arg(long, env = "CERT_FILE", default_value = "./certs/cert.pem")]
    cert_file: PathBuf,

    /// Private key file (PEM)
    #[arg(long, env = "KEY_FILE", default_value = "./certs/key.pem")]
    key_file: PathBuf,

    /// Generate a self-signed certificate for this host if the files are missing
    #[arg(long, value_name = "HOST")]
    self_signed: Option<String>,

    /// Reload the certificate pair every N seconds
    #[arg(long, env = "CERT_RELOAD_INTERVAL", value_parser = clap::value_parser!(u64).range(1..))]
    cert_reload_interval: Option<u64>,

    /// Seconds to wait for upstream response headers
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value = "30")]
    upstream_timeout: u64,

    /// Seconds to wait for request headers
    #[arg(long, env = "READ_TIMEOUT", default_value = "5")]
    read_timeout: u64,

    /// Maximum request header size in bytes
    #[arg(long, env = "MAX_HEADER_BYTES", default_value = "1048576")]
    max_header_bytes: usize,

    /// Do not read admin commands from stdin
    #[arg(long)]
    no_console: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // Production mode overrides
    if args.production {
        args.http_port = 80;
        args.https_port = 443;
        args.enable_https = true;
    }

    // Initialize logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,rustls=warn",
            args.log_level.to_lowercase()
        ))
    });
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting EdgeProxy v1.0.0");
    info!("HTTP port: {}", args.http_port);

    let certificates = if args.enable_https {
        info!("HTTPS port: {}", args.https_port);

        if let Some(host) = &args.self_signed {
            if !args.cert_file.exists() || !args.key_file.exists() {
                generate_self_signed(&[host.clone()], &args.cert_file, &args.key_file)
                    .context("failed to generate self-signed certificate")?;
            }
        }

        let store = CertificateStore::new(&args.cert_file, &args.key_file)
            .context("failed to load initial certificate")?;
        info!("Certificates loaded for: {:?}", store.hostnames());
        Some(Arc::new(store))
    } else {
        None
    };

    let table = Arc::new(RouteTable::new());
    for route in &args.routes {
        table
            .add(&route.name, &route.path, &route.url)
            .with_context(|| format!("failed to set up route {}", route.name))?;
    }

    if let (Some(store), Some(secs)) = (&certificates, args.cert_reload_interval) {
        spawn_certificate_reloader(store.clone(), Duration::from_secs(secs));
    }

    if !args.no_console {
        let mut console = Console::new(table.clone());
        if let Some(store) = &certificates {
            console = console.with_certificates(store.clone());
        }
        // Detached: returning from main ends the process even while it waits for input
        console
            .spawn(BufReader::new(std::io::stdin()), std::io::stdout())
            .context("failed to start console thread")?;
    }

    let dispatcher = Dispatcher::new(table)
        .with_mount(args.mount.clone())
        .with_upstream_timeout(Duration::from_secs(args.upstream_timeout));

    let config = ProxyConfig {
        bind_address: args.bind,
        http_port: args.http_port,
        https_port: args.https_port,
        enable_https: args.enable_https,
        force_https: args.force_https,
        header_read_timeout: Duration::from_secs(args.read_timeout),
        max_header_bytes: args.max_header_bytes,
    };

    let server = Arc::new(ProxyServer::new(config, dispatcher, certificates));

    info!("EdgeProxy started successfully");

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    info!("EdgeProxy stopped");

    Ok(())
}

/// Re-read the certificate pair on a fixed interval
fn spawn_certificate_reloader(store: Arc<CertificateStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; the store was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.reload()).await {
                Ok(Ok(hostname)) => debug!("Periodic reload refreshed {}", hostname),
                Ok(Err(e)) => warn!("Periodic certificate reload failed: {}", e),
                Err(e) => warn!("Periodic certificate reload panicked: {}", e),
            }
        }
    });
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
