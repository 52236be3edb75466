//! tunnel_proxy library: transport core for a tunneling HTTP proxy
//!
//! This library provides the pieces a forwarding proxy is built from: name
//! resolution that filters poisoned answers, latency-raced connection
//! establishment, a relay tunnel codec with downgrade handling, parallel
//! range reassembly for large bodies, and a plain forwarding path for
//! traffic that skips the relay.
//!
//! # Example
//!
//! ```no_run
//! use tunnel_proxy::{ClientRequest, ProxyConfig, ProxyEngine};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ProxyConfig::default();
//! config.relay.identities = vec![
//!     "relay-1.example.net".to_string(),
//!     "relay-2.example.net".to_string(),
//! ];
//! let engine = ProxyEngine::new(config)?;
//!
//! let request = ClientRequest {
//!     method: http::Method::GET,
//!     url: "http://example.org/".to_string(),
//!     headers: http::HeaderMap::new(),
//!     body: bytes::Bytes::new(),
//! };
//! let mut client = tokio::io::stdout();
//! engine.serve_relay(request, &mut client).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! This library requires a Tokio runtime. Use `#[tokio::main]` in your
//! application or call into it from an existing async context.

pub mod config;
pub mod error_handling;
pub mod forward;
pub mod http;
pub mod proxy;
pub mod racer;
pub mod range;
pub mod resolver;
pub mod tunnel;

// Re-export public API
pub use config::ProxyConfig;
pub use http::ClientRequest;
pub use proxy::{CertificateProvider, ProxyEngine};
