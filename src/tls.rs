//! TLS configuration for both legs of an intercepted connection
//!
//! The client-facing leg is accepted lazily: the ClientHello is read first so
//! the SNI name is known, the origin is reached with that name, and only then
//! is a certificate forged and the handshake finished.
use crate::ca::CertificateAuthority;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::socket::Socket;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

/// Where a `CONNECT` asked to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  /// host name or IP literal
  pub host: String,
  /// port
  pub port: u16,
}

impl Target {
  /// Parse the authority-form target of a `CONNECT`, `host:port`.
  pub fn parse(authority: &str) -> Result<Self> {
    let (host, port) = crate::record::split_authority(authority);
    let port = port
      .ok_or_else(|| Error::parse(format!("CONNECT target without port: {}", authority)))?
      .parse::<u16>()
      .map_err(|_| Error::parse(format!("invalid port in CONNECT target: {}", authority)))?;
    if host.is_empty() {
      return Err(Error::parse(format!("CONNECT target without host: {}", authority)));
    }
    Ok(Target {
      host: host.to_string(),
      port,
    })
  }
}

impl std::fmt::Display for Target {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Both TLS legs of an intercepted tunnel, handshakes done.
#[derive(Debug)]
pub struct ResolvedTls<IO> {
  /// session with the client, under a forged certificate
  pub client: TlsStream<IO>,
  /// session with the origin
  pub origin: Socket,
  /// name the client asked for
  pub server_name: String,
}

/// Builds TLS configurations and runs the two handshakes of an interception.
#[derive(Clone, Debug)]
pub struct TlsResolver {
  connector: Connector,
  roots: Arc<RootCertStore>,
  verify_origin_certs: bool,
}

impl TlsResolver {
  /// `extra_roots` are trusted in addition to the platform roots.
  pub fn new(
    connector: Connector,
    verify_origin_certs: bool,
    extra_roots: Vec<CertificateDer<'static>>,
  ) -> Self {
    let mut roots = RootCertStore::empty();
    if verify_origin_certs {
      let native = rustls_native_certs::load_native_certs();
      for e in native.errors {
        tracing::warn!("loading platform root certificates: {}", e);
      }
      let (added, ignored) = roots.add_parsable_certificates(native.certs);
      tracing::debug!("platform roots: {} added, {} ignored", added, ignored);
    }
    for cert in extra_roots {
      if let Err(e) = roots.add(cert) {
        tracing::warn!("ignoring extra root certificate: {}", e);
      }
    }
    TlsResolver {
      connector,
      roots: Arc::new(roots),
      verify_origin_certs,
    }
  }

  /// Read every certificate out of a PEM bundle file.
  pub fn load_pem_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path.as_ref())?;
    rustls_pemfile::certs(&mut &pem[..])
      .map(|result| {
        result.map_err(|e| {
          Error::decode(format!("{}: invalid certificate encoding: {}", path.as_ref().display(), e))
        })
      })
      .collect()
  }

  /// The dialer used for both legs.
  pub fn connector(&self) -> &Connector {
    &self.connector
  }

  /// A fresh origin-facing client configuration.
  pub fn client_config(&self) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::handshake(format!("client config: {}", e)))?;
    let mut config = if self.verify_origin_certs {
      builder
        .with_root_certificates(self.roots.clone())
        .with_no_client_auth()
    } else {
      builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
    };
    // the relay and the reader only speak HTTP/1.x
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
  }

  /// Run the origin handshake on an already dialed TCP socket.
  pub async fn upgrade_origin(&self, tcp: Socket, server_name: &str) -> Result<Socket> {
    let config = Arc::new(self.client_config()?);
    let socket = self.connector.upgrade_to_tls(tcp, server_name, config).await?;
    tracing::debug!(
      "origin {} ({}) speaks {}",
      server_name,
      socket.peer_addr(),
      socket
        .alpn_protocol()
        .map(String::from_utf8_lossy)
        .unwrap_or_else(|| "http/1.1".into())
    );
    Ok(socket)
  }

  /// Intercept the TLS session a client starts on `client_io`.
  ///
  /// `origin_tcp` is the already dialed connection to `target`; it is
  /// upgraded with the client's SNI name (or the target host when the
  /// client sent none) before a certificate for that name is forged and the
  /// client handshake is completed.
  pub async fn accept<IO>(
    &self,
    client_io: IO,
    origin_tcp: Socket,
    target: &Target,
    ca: &CertificateAuthority,
  ) -> Result<ResolvedTls<IO>>
  where
    IO: AsyncRead + AsyncWrite + Unpin,
  {
    let start = LazyConfigAcceptor::new(Acceptor::default(), client_io)
      .await
      .map_err(|e| Error::handshake(format!("reading ClientHello for {}: {}", target, e)))?;
    let server_name = start
      .client_hello()
      .server_name()
      .map(str::to_string)
      .unwrap_or_else(|| target.host.clone());
    tracing::debug!("{} client asked for {}", target, server_name);

    let origin = self
      .upgrade_origin(origin_tcp, &server_name)
      .await
      .map_err(|e| match e {
        Error::Handshake(_) => e,
        e => Error::handshake(format!("origin {}: {}", target, e)),
      })?;

    let forged = ca.issue(&server_name)?;
    let config = server_config(&forged)?;
    let client = start
      .into_stream(Arc::new(config))
      .await
      .map_err(|e| Error::handshake(format!("client handshake for {}: {}", server_name, e)))?;
    Ok(ResolvedTls {
      client,
      origin,
      server_name,
    })
  }
}

/// Server configuration presenting one forged certificate.
pub fn server_config(forged: &crate::ca::ForgedCertificate) -> Result<rustls::ServerConfig> {
  rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::handshake(format!("server config: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(forged.chain.clone(), forged.private_key())
    .map_err(|e| Error::handshake(format!("server config: {}", e)))
}

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connect_targets() {
    assert_eq!(
      Target::parse("example.com:443").unwrap(),
      Target {
        host: "example.com".into(),
        port: 443
      }
    );
    let v6 = Target::parse("[::1]:8443").unwrap();
    assert_eq!(v6.host, "::1");
    assert_eq!(v6.to_string(), "[::1]:8443");
    assert!(Target::parse("example.com").is_err());
    assert!(Target::parse("example.com:https").is_err());
  }

  #[test]
  fn client_config_is_http1_only() {
    let resolver = TlsResolver::new(Connector::default(), false, vec![]);
    let config = resolver.client_config().unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[test]
  fn forged_certificate_makes_a_server_config() {
    let ca = CertificateAuthority::generate("snare tls test").unwrap();
    let forged = ca.issue("localhost").unwrap();
    assert!(server_config(&forged).is_ok());
  }
}
