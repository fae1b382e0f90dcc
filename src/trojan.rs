//! Trojan tunnel dialer.
//!
//! Dials a secret-authenticated TCP tunnel: raw connect to the tunnel
//! server, outer TLS handshake, then a single length-prefixed connect
//! request carrying the SHA-224 fingerprint of the shared secret. The
//! protocol defines no acknowledgment: the tunnel is usable for data as
//! soon as the request is written, and a server-side rejection surfaces
//! only when the subsequent exchange fails.
//!
//! When the ultimate destination is itself TLS-protected (port 443 or an
//! https URL), a second, strictly verified TLS handshake runs *inside* the
//! tunnel, so the payload stays encrypted end to end: the outer layer only
//! reaches the tunnel server.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{ProxyConfig, ProxyKind};

/// Dial timeout for the raw TCP connect to the tunnel server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect request command code.
const CMD_CONNECT: u8 = 0x01;

/// Address type code for a domain-name destination.
const ATYP_DOMAIN: u8 = 0x03;

/// Tunnel dial failure, one variant per protocol stage.
#[derive(Debug, thiserror::Error)]
pub enum TrojanError {
    #[error("proxy config is not a trojan config (kind: {kind})")]
    NotTrojan { kind: ProxyKind },

    #[error("trojan config has no shared secret")]
    MissingSecret,

    #[error("destination hostname exceeds 255 bytes: {host}")]
    HostTooLong { host: String },

    #[error("invalid TLS server name: {name}")]
    InvalidServerName { name: String },

    #[error("failed to build TLS config: {0}")]
    TlsConfig(#[source] rustls::Error),

    #[error("connect to tunnel server {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("failed to connect to tunnel server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("outer TLS handshake with tunnel server {host} failed: {source}")]
    OuterHandshake {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send tunnel connect request: {0}")]
    ConnectRequest(#[source] io::Error),

    #[error("inner TLS handshake with {host} failed: {source}")]
    InnerHandshake {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Tunnel dial options.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Trust the tunnel server's certificate without verification.
    ///
    /// Defaults to `true`: the shared secret is the real authenticator on
    /// this hop, and tunnel servers commonly present self-signed or
    /// mismatched certificates. Set to `false` to enforce webpki roots on
    /// the outer handshake as well.
    pub accept_invalid_outer_cert: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            accept_invalid_outer_cert: true,
        }
    }
}

/// An established tunnel connection: outer-TLS-wrapped, or doubly wrapped
/// when the destination required its own TLS layer.
#[derive(Debug)]
pub enum TrojanStream {
    Outer(TlsStream<TcpStream>),
    Inner(Box<TlsStream<TlsStream<TcpStream>>>),
}

impl AsyncRead for TrojanStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Outer(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Inner(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TrojanStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Outer(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Inner(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Outer(stream) => Pin::new(stream).poll_flush(cx),
            Self::Inner(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Outer(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Inner(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial the tunnel described by `config` and open it toward
/// `dest_host:dest_port`.
///
/// `dest_tls` forces the inner TLS layer for destinations flagged as
/// TLS-protected regardless of port; port 443 always gets it.
pub async fn dial(
    config: &ProxyConfig,
    dest_host: &str,
    dest_port: u16,
    dest_tls: bool,
    options: &DialOptions,
) -> Result<TrojanStream, TrojanError> {
    if config.kind != ProxyKind::Trojan {
        return Err(TrojanError::NotTrojan {
            kind: config.kind.clone(),
        });
    }
    let secret = config
        .password
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .ok_or(TrojanError::MissingSecret)?;

    // Encode the connect request up front so config errors surface before
    // any socket is opened.
    let request = connect_request(secret, dest_host, dest_port)?;

    let addr = format!("{}:{}", config.host, config.port);
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TrojanError::ConnectTimeout { addr: addr.clone() })?
        .map_err(|source| TrojanError::Connect {
            addr: addr.clone(),
            source,
        })?;

    let outer_connector = TlsConnector::from(Arc::new(outer_tls_config(
        options.accept_invalid_outer_cert,
    )?));
    let server_name = ServerName::try_from(config.host.clone()).map_err(|_| {
        TrojanError::InvalidServerName {
            name: config.host.clone(),
        }
    })?;
    let mut outer = outer_connector
        .connect(server_name, tcp)
        .await
        .map_err(|source| TrojanError::OuterHandshake {
            host: config.host.clone(),
            source,
        })?;

    outer
        .write_all(&request)
        .await
        .map_err(TrojanError::ConnectRequest)?;
    outer.flush().await.map_err(TrojanError::ConnectRequest)?;

    tracing::debug!("tunnel to {dest_host}:{dest_port} open via {addr}");

    if !dest_tls && dest_port != 443 {
        return Ok(TrojanStream::Outer(outer));
    }

    // The tunnel only encrypts the hop to the tunnel server; a TLS-protected
    // destination still needs its own end-to-end handshake, strictly
    // verified against the true destination host.
    let inner_connector = TlsConnector::from(Arc::new(inner_tls_config()?));
    let dest_name = ServerName::try_from(dest_host.to_string()).map_err(|_| {
        TrojanError::InvalidServerName {
            name: dest_host.to_string(),
        }
    })?;
    let inner = inner_connector
        .connect(dest_name, outer)
        .await
        .map_err(|source| TrojanError::InnerHandshake {
            host: dest_host.to_string(),
            source,
        })?;

    tracing::debug!("inner TLS handshake completed for {dest_host}:{dest_port}");

    Ok(TrojanStream::Inner(Box::new(inner)))
}

/// Encode the authenticated connect request:
///
/// ```text
/// +-----------------------+---------+-----+------+-----+----------+------+---------+
/// | hex(SHA224(secret))   |  CRLF   | CMD | ATYP | len | hostname | port |  CRLF   |
/// +-----------------------+---------+-----+------+-----+----------+------+---------+
/// |          56           | 0D 0A   |  01 |  03  |  1  | variable | BE16 | 0D 0A   |
/// +-----------------------+---------+-----+------+-----+----------+------+---------+
/// ```
pub fn connect_request(
    secret: &str,
    dest_host: &str,
    dest_port: u16,
) -> Result<Vec<u8>, TrojanError> {
    if dest_host.len() > usize::from(u8::MAX) {
        return Err(TrojanError::HostTooLong {
            host: dest_host.to_string(),
        });
    }

    let fingerprint = hex::encode(Sha224::digest(secret.as_bytes()));

    let mut request = Vec::with_capacity(fingerprint.len() + dest_host.len() + 9);
    request.extend_from_slice(fingerprint.as_bytes());
    request.extend_from_slice(b"\r\n");
    request.push(CMD_CONNECT);
    request.push(ATYP_DOMAIN);
    request.push(dest_host.len() as u8);
    request.extend_from_slice(dest_host.as_bytes());
    request.extend_from_slice(&dest_port.to_be_bytes());
    request.extend_from_slice(b"\r\n");
    Ok(request)
}

/// TLS config for the outer hop. SNI is set by the caller; verification is
/// skipped unless `accept_invalid_outer_cert` is off.
fn outer_tls_config(accept_invalid_outer_cert: bool) -> Result<rustls::ClientConfig, TrojanError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(TrojanError::TlsConfig)?;

    let config = if accept_invalid_outer_cert {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms }))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(webpki_root_store())
            .with_no_client_auth()
    };
    Ok(config)
}

/// TLS config for the inner, end-to-end handshake: always webpki-verified.
fn inner_tls_config() -> Result<rustls::ClientConfig, TrojanError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(TrojanError::TlsConfig)?
        .with_root_certificates(webpki_root_store())
        .with_no_client_auth();
    Ok(config)
}

fn webpki_root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Certificate verifier that accepts any tunnel-server certificate.
///
/// Signatures are still checked against the presented certificate, so a
/// passive observer can't splice into an established session; only the
/// chain-of-trust check is waived.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trojan_config(host: &str, port: u16, secret: &str) -> ProxyConfig {
        ProxyConfig {
            kind: ProxyKind::Trojan,
            host: host.to_string(),
            port,
            username: None,
            password: Some(secret.to_string()),
            enabled: true,
        }
    }

    #[test]
    fn connect_request_byte_exact() {
        let request = connect_request("hunter2", "example.com", 443).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"84ca85078d6fa3a9b01dae0242938a9b71c9c6920f8d790505cad7a7");
        expected.extend_from_slice(b"\r\n");
        expected.extend_from_slice(&[0x01, 0x03, 0x0b]);
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xbb]);
        expected.extend_from_slice(b"\r\n");

        assert_eq!(request, expected);
    }

    #[test]
    fn connect_request_fingerprint_is_56_hex_chars() {
        let request = connect_request("another secret", "example.com", 80).unwrap();
        let fingerprint = &request[..56];
        assert!(fingerprint
            .iter()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        assert_eq!(&request[56..58], b"\r\n");
    }

    #[test]
    fn connect_request_port_big_endian() {
        let request = connect_request("s", "h", 8080).unwrap();
        // 56 (hash) + 2 (CRLF) + 2 (cmd, atyp) + 1 (len) + 1 (host) = 62
        assert_eq!(&request[62..64], &[0x1f, 0x90]);
    }

    #[test]
    fn connect_request_rejects_long_hostname() {
        let long_host = "a".repeat(256);
        assert!(matches!(
            connect_request("s", &long_host, 443),
            Err(TrojanError::HostTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn dial_rejects_non_trojan_config() {
        let config = ProxyConfig::from_literal_url("http://proxy.example:8080");
        let err = dial(&config, "example.com", 80, false, &DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrojanError::NotTrojan { .. }));
    }

    #[tokio::test]
    async fn dial_rejects_missing_secret() {
        let mut config = trojan_config("tunnel.example", 443, "");
        config.password = None;
        let err = dial(&config, "example.com", 80, false, &DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrojanError::MissingSecret));
    }

    #[tokio::test]
    async fn dial_rejects_empty_secret() {
        let config = trojan_config("tunnel.example", 443, "");
        let err = dial(&config, "example.com", 80, false, &DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrojanError::MissingSecret));
    }

    #[tokio::test]
    async fn dial_fails_when_server_closes_before_handshake() {
        // A listener that accepts and immediately drops the socket: the TCP
        // connect succeeds, the outer TLS handshake cannot.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let config = trojan_config("127.0.0.1", port, "hunter2");
        let err = dial(&config, "example.com", 80, false, &DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrojanError::OuterHandshake { .. }));
    }

    #[test]
    fn dial_options_default_accepts_invalid_outer_cert() {
        assert!(DialOptions::default().accept_invalid_outer_cert);
    }
}
