//! EdgeProxy - An edge reverse proxy with runtime-managed routes
//!
//! Provides:
//! - A route table mapping path prefixes to upstream backends, mutable while serving
//! - Per-request dispatch with a fallback for removed routes
//! - SNI-based certificate selection with hot reload
//! - A line-oriented admin console for managing routes

pub mod backend;
pub mod certificate;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod proxy;
pub mod routes;

pub use backend::Backend;
pub use certificate::CertificateStore;
pub use console::{Command, Console};
pub use dispatch::Dispatcher;
pub use error::{ProxyError, Result};
pub use proxy::{ProxyConfig, ProxyServer};
pub use routes::{RouteEntry, RouteTable};
