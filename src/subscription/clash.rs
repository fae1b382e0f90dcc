//! Clash-style YAML node-list parser.
//!
//! Decodes a subscription document shaped as a `proxies:` list of named
//! nodes and converts the first one into a proxy config. Node types this
//! client cannot actually speak (trojan, vmess) fail the whole attempt so
//! the resolver falls through to the next strategy instead of silently
//! returning a misrouted config.

use anyhow::{bail, Result};
use serde::Deserialize;

use super::Candidate;
use crate::config::{ProxyConfig, ProxyKind};

/// Top-level subscription document. Extra keys (rules, groups, ...) are
/// ignored; a missing `proxies` key decodes as an empty list.
#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    proxies: Vec<Node>,
}

/// A single named proxy node.
#[derive(Debug, Deserialize)]
struct Node {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    node_type: String,
    server: String,
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Parse `content` as a YAML node list and return the first node as a
/// candidate.
///
/// `approximate_shadowsocks` maps `ss` nodes onto SOCKS5. That is a
/// best-effort approximation, not a protocol bridge; with it disabled an
/// `ss` node is treated like any other unsupported type and fails the
/// attempt.
pub(crate) fn first_candidate(content: &str, approximate_shadowsocks: bool) -> Result<Candidate> {
    let list: NodeList =
        serde_yml::from_str(content).map_err(|e| anyhow::anyhow!("invalid node-list YAML: {e}"))?;

    let Some(node) = list.proxies.into_iter().next() else {
        bail!("no proxy nodes in document");
    };

    node_to_candidate(node, approximate_shadowsocks)
}

fn node_to_candidate(node: Node, approximate_shadowsocks: bool) -> Result<Candidate> {
    let kind = match node.node_type.to_ascii_lowercase().as_str() {
        "http" | "https" => ProxyKind::Http,
        "socks5" | "socks" => ProxyKind::Socks5,
        "ss" | "shadowsocks" if approximate_shadowsocks => {
            tracing::debug!(
                "approximating shadowsocks node '{}' as socks5",
                node.name.as_deref().unwrap_or("")
            );
            ProxyKind::Socks5
        }
        "ss" | "shadowsocks" => {
            bail!("shadowsocks node requires a dedicated client (approximation disabled)")
        }
        "trojan" | "vmess" => {
            bail!("proxy type '{}' requires a dedicated client", node.node_type)
        }
        other => bail!("unknown proxy type: {other}"),
    };

    Ok(Candidate {
        name: node.name,
        config: ProxyConfig {
            kind,
            host: node.server,
            port: node.port,
            username: node.username,
            password: node.password,
            enabled: true,
        },
    })
}
