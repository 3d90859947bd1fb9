//! Proxy configuration and the service object tying the parts together
use crate::admin::{AdminApi, AdminServer};
use crate::ca::CertificateAuthority;
use crate::client::OriginClient;
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::Result;
use crate::server::ProxyServer;
use crate::storage::Storage;
use crate::tls::TlsResolver;
use crate::tunnel::TunnelInterceptor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the proxy
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// proxy listener
  pub listen_addr: SocketAddr,
  /// admin API listener, `None` disables it
  pub admin_addr: Option<SocketAddr>,
  /// root certificate, PEM
  pub ca_cert_path: PathBuf,
  /// root private key, PEM PKCS#8
  pub ca_key_path: PathBuf,
  /// resolve + connect deadline for origins
  pub connect_timeout: Duration,
  /// deadline for reading a request head from a client or a response from an origin
  pub read_timeout: Duration,
  /// deadline for each single read or write inside a tunnel
  pub relay_idle_timeout: Duration,
  /// verify origin certificates
  pub verify_origin_certs: bool,
  /// PEM files whose certificates are trusted for origins on top of the platform roots
  pub extra_root_certs: Vec<PathBuf>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
      admin_addr: Some(SocketAddr::from(([127, 0, 0, 1], 8000))),
      ca_cert_path: PathBuf::from("server.crt"),
      ca_key_path: PathBuf::from("server.key"),
      connect_timeout: Duration::from_secs(10),
      read_timeout: Duration::from_secs(30),
      relay_idle_timeout: Duration::from_secs(30),
      verify_origin_certs: true,
      extra_root_certs: vec![],
    }
  }
}

impl ProxyConfig {
  /// The origin dialer this configuration describes.
  pub fn connector(&self) -> Connector {
    ConnectorBuilder::default()
      .connect_timeout(Some(self.connect_timeout))
      .read_timeout(Some(self.read_timeout))
      .write_timeout(Some(self.read_timeout))
      .nodelay(true)
      .keepalive(true)
      .build()
  }

  /// TLS settings for origin connections, extra roots loaded from disk.
  pub fn resolver(&self) -> Result<TlsResolver> {
    let mut extra_roots = Vec::new();
    for path in &self.extra_root_certs {
      extra_roots.extend(TlsResolver::load_pem_certs(path)?);
    }
    Ok(TlsResolver::new(
      self.connector(),
      self.verify_origin_certs,
      extra_roots,
    ))
  }
}

/// The intercepting proxy: root CA, storage and configuration.
#[derive(Clone)]
pub struct InterceptProxy {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  storage: Arc<dyn Storage>,
}

impl InterceptProxy {
  /// Assemble a proxy from its parts.
  pub fn new(config: ProxyConfig, ca: Arc<CertificateAuthority>, storage: Arc<dyn Storage>) -> Self {
    Self {
      config,
      ca,
      storage,
    }
  }

  /// Load the root CA from the configured paths.
  pub async fn load(config: ProxyConfig, storage: Arc<dyn Storage>) -> Result<Self> {
    let ca = CertificateAuthority::load_root(&config.ca_cert_path, &config.ca_key_path).await?;
    Ok(Self::new(config, Arc::new(ca), storage))
  }

  /// The configuration in use.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// The root CA.
  pub fn ca(&self) -> Arc<CertificateAuthority> {
    self.ca.clone()
  }

  /// The storage records go to.
  pub fn storage(&self) -> Arc<dyn Storage> {
    self.storage.clone()
  }

  /// The proxy listener.
  pub fn server(&self) -> Result<ProxyServer> {
    let resolver = self.config.resolver()?;
    let tunnels = TunnelInterceptor::new(
      self.ca.clone(),
      self.storage.clone(),
      resolver.clone(),
      self.config.relay_idle_timeout,
    );
    Ok(ProxyServer::new(
      OriginClient::new(resolver),
      tunnels,
      self.storage.clone(),
      self.config.read_timeout,
    ))
  }

  /// The admin API.
  pub fn admin(&self) -> Result<AdminApi> {
    Ok(AdminApi::new(
      self.storage.clone(),
      OriginClient::new(self.config.resolver()?),
      self.ca.clone(),
    ))
  }

  /// Bind the configured listeners and serve until one of them fails.
  pub async fn run(&self) -> Result<()> {
    let server = self.server()?;
    match self.config.admin_addr {
      Some(addr) => {
        let admin = AdminServer::new(self.admin()?, self.config.read_timeout);
        tokio::select! {
          r = server.run(self.config.listen_addr) => r,
          r = admin.run(addr) => r,
        }
      }
      None => server.run(self.config.listen_addr).await,
    }
  }
}
