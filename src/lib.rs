//! Caller-selectable outbound egress for HTTP clients.
//!
//! A caller supplies a proxy specifier (nothing, a literal proxy URL, or a
//! subscription URL naming a remote document of proxy nodes) and gets back
//! an HTTP client routed accordingly: direct, through a standard HTTP or
//! SOCKS5 proxy, or through a secret-authenticated trojan tunnel with
//! double TLS for TLS-protected destinations.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! let resolver = viaduct::Resolver::new();
//! let config = viaduct::resolve_specifier(&resolver, "http://proxy.example:8080").await;
//! let client = viaduct::build_client(&config)?;
//! let response = client.get("https://api.example.com/user").await?;
//! assert_eq!(response.status, 200);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod specifier;
pub mod subscription;
pub mod trojan;

pub use client::{build_client, ClientError, HttpClient, HttpResponse, TrojanClient};
pub use config::{ProxyConfig, ProxyKind};
pub use specifier::{looks_like_subscription, resolve_specifier};
pub use subscription::{parse_document, Candidate, Resolver};
pub use trojan::{DialOptions, TrojanError, TrojanStream};
