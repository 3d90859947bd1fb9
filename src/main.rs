use clap::Parser;
use snare::{CertificateAuthority, InterceptProxy, MemoryStorage, ProxyConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Intercepting HTTP/HTTPS forward proxy that records traffic for replay
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
  /// proxy listen address
  #[arg(long, env = "SNARE_LISTEN", default_value = "127.0.0.1:8080")]
  listen: SocketAddr,
  /// admin API listen address
  #[arg(long, env = "SNARE_ADMIN", default_value = "127.0.0.1:8000")]
  admin: SocketAddr,
  /// do not start the admin API
  #[arg(long)]
  no_admin: bool,
  /// root certificate, PEM
  #[arg(long, env = "SNARE_CA_CERT", default_value = "server.crt")]
  ca_cert: PathBuf,
  /// root private key, PEM PKCS#8
  #[arg(long, env = "SNARE_CA_KEY", default_value = "server.key")]
  ca_key: PathBuf,
  /// create the root certificate and key when they do not exist yet
  #[arg(long)]
  generate_ca: bool,
  /// origin connect timeout in seconds
  #[arg(long, env = "SNARE_CONNECT_TIMEOUT", default_value_t = 10)]
  connect_timeout: u64,
  /// client and origin read timeout in seconds
  #[arg(long, env = "SNARE_READ_TIMEOUT", default_value_t = 30)]
  read_timeout: u64,
  /// tunnel idle timeout in seconds
  #[arg(long, env = "SNARE_IDLE_TIMEOUT", default_value_t = 30)]
  idle_timeout: u64,
  /// accept any origin certificate
  #[arg(long, short = 'k')]
  insecure: bool,
  /// extra PEM file of origin roots, may be repeated
  #[arg(long = "extra-root")]
  extra_roots: Vec<PathBuf>,
  /// debug logging
  #[arg(long)]
  debug: bool,
}

impl Args {
  fn config(&self) -> ProxyConfig {
    ProxyConfig {
      listen_addr: self.listen,
      admin_addr: (!self.no_admin).then_some(self.admin),
      ca_cert_path: self.ca_cert.clone(),
      ca_key_path: self.ca_key.clone(),
      connect_timeout: Duration::from_secs(self.connect_timeout),
      read_timeout: Duration::from_secs(self.read_timeout),
      relay_idle_timeout: Duration::from_secs(self.idle_timeout),
      verify_origin_certs: !self.insecure,
      extra_root_certs: self.extra_roots.clone(),
    }
  }
}

async fn ensure_root(config: &ProxyConfig) -> snare::Result<()> {
  if config.ca_cert_path.exists() && config.ca_key_path.exists() {
    return Ok(());
  }
  let ca = CertificateAuthority::generate("snare root CA")?;
  ca.write_pem(&config.ca_cert_path, &config.ca_key_path)
    .await?;
  tracing::info!(
    "generated root CA at {} and {}",
    config.ca_cert_path.display(),
    config.ca_key_path.display()
  );
  Ok(())
}

#[tokio::main]
async fn main() -> snare::Result<()> {
  let args = Args::parse();
  let default_level = if args.debug { "snare=debug" } else { "snare=info" };
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
    )
    .with_target(false)
    .init();

  let config = args.config();
  if args.generate_ca {
    ensure_root(&config).await?;
  }
  if !config.verify_origin_certs {
    tracing::warn!("origin certificates are not verified");
  }
  let proxy = InterceptProxy::load(config, Arc::new(MemoryStorage::new())).await?;
  proxy.run().await
}
