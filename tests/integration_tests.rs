//! Integration tests for snare

use snare::wire;
use snare::{
  CapturedRequest, CertificateAuthority, InterceptProxy, MemoryStorage, ProxyConfig, Storage,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn test_config() -> ProxyConfig {
  ProxyConfig {
    listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
    admin_addr: None,
    connect_timeout: Duration::from_secs(2),
    read_timeout: Duration::from_secs(5),
    relay_idle_timeout: Duration::from_secs(5),
    ..Default::default()
  }
}

/// Start a proxy on an ephemeral port.
async fn start_proxy(
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
) -> (SocketAddr, Arc<MemoryStorage>) {
  let storage = Arc::new(MemoryStorage::new());
  let proxy = InterceptProxy::new(config, ca, storage.clone());
  let server = proxy.server().unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move { server.serve(listener).await });
  (addr, storage)
}

/// Serve `response` once to every connection and report what was asked.
async fn start_origin<S, F, Fut>(
  response: &'static [u8],
  wrap: F,
) -> (SocketAddr, mpsc::UnboundedReceiver<wire::RawRequest>)
where
  F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = S> + Send,
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    loop {
      let (stream, _) = listener.accept().await.unwrap();
      let mut reader = BufReader::new(wrap(stream).await);
      let tx = tx.clone();
      tokio::spawn(async move {
        let request = wire::read_request(&mut reader).await.unwrap();
        tx.send(request).unwrap();
        let stream = reader.get_mut();
        stream.write_all(response).await.unwrap();
        stream.shutdown().await.unwrap();
      });
    }
  });
  (addr, rx)
}

async fn plain(stream: TcpStream) -> TcpStream {
  stream
}

/// Wait until the pair for `id` has landed in storage.
async fn wait_for_pair(storage: &MemoryStorage, id: u64) -> CapturedRequest {
  for _ in 0..100 {
    if storage.get_response(id).await.is_ok() {
      return storage.get_request(id).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("pair {} never stored", id);
}

#[tokio::test]
async fn plain_http_is_forwarded_and_recorded() {
  let (origin, mut asked) = start_origin(
    b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nSet-Cookie: s=1; Path=/\r\n\r\nhello",
    plain,
  )
  .await;
  let ca = Arc::new(CertificateAuthority::generate("snare integration root").unwrap());
  let (proxy, storage) = start_proxy(test_config(), ca).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{}/foo?x=1 HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nCookie: a=b\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
    origin.port(),
    origin.port()
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let mut answer = Vec::new();
  client.read_to_end(&mut answer).await.unwrap();
  let answer = String::from_utf8(answer).unwrap();
  assert!(answer.starts_with("HTTP/1.1 200 OK\r\n"), "{}", answer);
  assert!(answer.ends_with("hello"));

  let seen = asked.recv().await.unwrap();
  assert_eq!(seen.target, "/foo?x=1");
  assert!(seen.headers.get("proxy-connection").is_none());
  assert_eq!(seen.headers.get("cookie").unwrap(), "a=b");

  let request = wait_for_pair(&storage, 1).await;
  assert_eq!(request.scheme, "http");
  assert_eq!(request.host, "127.0.0.1");
  assert_eq!(request.port, origin.port().to_string());
  assert_eq!(request.path, "/foo");
  assert_eq!(request.get_params["x"], vec!["1".to_string()]);
  assert_eq!(request.cookies.len(), 1);
  assert_eq!(request.cookies[0].name, "a");
  let response = storage.get_response(1).await.unwrap();
  assert_eq!(response.status.as_u16(), 200);
  assert_eq!(response.text, "hello");
  assert_eq!(response.cookies[0].name, "s");
}

#[tokio::test]
async fn gzip_bodies_are_stored_decoded() {
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::io::Write;

  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(b"hello").unwrap();
  let gz = encoder.finish().unwrap();
  let mut response = format!(
    "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
    gz.len()
  )
  .into_bytes();
  response.extend_from_slice(&gz);
  let response: &'static [u8] = Box::leak(response.into_boxed_slice());

  let (origin, _asked) = start_origin(response, plain).await;
  let ca = Arc::new(CertificateAuthority::generate("snare integration root").unwrap());
  let (proxy, storage) = start_proxy(test_config(), ca).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{}/ HTTP/1.1\r\nConnection: close\r\n\r\n",
    origin.port()
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let mut answer = Vec::new();
  client.read_to_end(&mut answer).await.unwrap();
  // the client gets the bytes the origin sent
  assert!(answer.ends_with(&gz));

  wait_for_pair(&storage, 1).await;
  let stored = storage.get_response(1).await.unwrap();
  assert_eq!(stored.body.as_bytes(), b"hello");
  assert_eq!(stored.text, "hello");
}

#[tokio::test]
async fn unreachable_origin_answers_500() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  let ca = Arc::new(CertificateAuthority::generate("snare integration root").unwrap());
  let (proxy, storage) = start_proxy(test_config(), ca).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port);
  client.write_all(request.as_bytes()).await.unwrap();
  let mut answer = Vec::new();
  client.read_to_end(&mut answer).await.unwrap();
  let answer = String::from_utf8(answer).unwrap();
  assert!(answer.starts_with("HTTP/1.1 500 "), "{}", answer);
  assert!(answer.ends_with("Failed to send request"));
  assert_eq!(storage.last_id(), 0);
}

#[tokio::test]
async fn malformed_request_answers_400() {
  let ca = Arc::new(CertificateAuthority::generate("snare integration root").unwrap());
  let (proxy, _storage) = start_proxy(test_config(), ca).await;
  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
  let mut answer = Vec::new();
  client.read_to_end(&mut answer).await.unwrap();
  assert!(answer.starts_with(b"HTTP/1.1 400 "));
}

#[tokio::test]
async fn connect_tunnel_is_intercepted_and_recorded() {
  let ca = Arc::new(CertificateAuthority::generate("snare integration root").unwrap());

  // the origin presents a certificate from the same root
  let origin_config = Arc::new(snare::tls::server_config(&ca.issue("localhost").unwrap()).unwrap());
  let acceptor = TlsAcceptor::from(origin_config);
  let (origin, mut asked) = start_origin(
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 6\r\n\r\nsecret",
    move |stream| {
      let acceptor = acceptor.clone();
      async move { acceptor.accept(stream).await.unwrap() }
    },
  )
  .await;

  let root_path = std::env::temp_dir().join(format!("snare-it-root-{}.pem", std::process::id()));
  std::fs::write(&root_path, ca.root_pem()).unwrap();
  let config = ProxyConfig {
    extra_root_certs: vec![root_path.clone()],
    ..test_config()
  };
  let (proxy, storage) = start_proxy(config, ca.clone()).await;

  let mut tcp = TcpStream::connect(proxy).await.unwrap();
  let connect = format!(
    "CONNECT localhost:{} HTTP/1.1\r\nHost: localhost:{}\r\n\r\n",
    origin.port(),
    origin.port()
  );
  tcp.write_all(connect.as_bytes()).await.unwrap();
  let mut head = Vec::new();
  while !head.ends_with(b"\r\n\r\n") {
    head.push(tcp.read_u8().await.unwrap());
  }
  assert!(head.starts_with(b"HTTP/1.1 200 "));

  let mut roots = rustls::RootCertStore::empty();
  roots.add(ca.root_der().clone()).unwrap();
  let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_root_certificates(roots)
  .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let mut tls = connector
    .connect(ServerName::try_from("localhost").unwrap(), tcp)
    .await
    .unwrap();
  tls
    .write_all(b"GET /account?user=me HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let mut answer = Vec::new();
  // the origin closes after one response; a missing close_notify is fine
  let _ = tls.read_to_end(&mut answer).await;
  assert!(answer.ends_with(b"secret"));
  tls.shutdown().await.ok();
  drop(tls);

  let seen = asked.recv().await.unwrap();
  assert_eq!(seen.target, "/account?user=me");

  let request = wait_for_pair(&storage, 1).await;
  assert_eq!(request.scheme, "https");
  assert_eq!(request.host, "localhost");
  assert_eq!(request.port, origin.port().to_string());
  assert_eq!(request.path, "/account");
  assert_eq!(request.get_params["user"], vec!["me".to_string()]);
  let response = storage.get_response(1).await.unwrap();
  assert_eq!(response.status_line, "200 OK");
  assert_eq!(response.text, "secret");
  assert_eq!(storage.list_requests().await.unwrap().len(), 1);

  std::fs::remove_file(&root_path).ok();
}

#[tokio::test]
async fn connect_to_closed_port_answers_503() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  let ca = Arc::new(CertificateAuthority::generate("snare integration root").unwrap());
  let (proxy, storage) = start_proxy(test_config(), ca).await;

  let mut tcp = TcpStream::connect(proxy).await.unwrap();
  let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port);
  tcp.write_all(connect.as_bytes()).await.unwrap();
  let mut answer = Vec::new();
  tcp.read_to_end(&mut answer).await.unwrap();
  assert!(answer.starts_with(b"HTTP/1.1 503 "));
  assert_eq!(storage.last_id(), 0);
}

#[test]
fn forged_leaf_is_signed_by_the_root() {
  use x509_parser::extensions::GeneralName;
  use x509_parser::parse_x509_certificate;

  let ca = CertificateAuthority::generate("snare integration root").unwrap();
  let forged = ca.issue("shop.example.com").unwrap();
  assert_eq!(forged.chain.len(), 2);
  assert_eq!(&forged.chain[1], ca.root_der());

  let (_, root) = parse_x509_certificate(ca.root_der().as_ref()).unwrap();
  let (_, leaf) = parse_x509_certificate(forged.leaf.as_ref()).unwrap();
  assert_eq!(leaf.issuer().to_string(), root.subject().to_string());
  let san = leaf.subject_alternative_name().unwrap().unwrap();
  let names: Vec<_> = san.value.general_names.iter().collect();
  assert_eq!(names.len(), 1);
  assert!(matches!(names[0], GeneralName::DNSName(name) if *name == "shop.example.com"));
  assert!(leaf.validity().is_valid());

  let key_usage = leaf.key_usage().unwrap().unwrap().value;
  assert!(key_usage.digital_signature());
  assert!(key_usage.key_encipherment());
  assert!(!key_usage.key_cert_sign());
  let eku = leaf.extended_key_usage().unwrap().unwrap().value;
  assert!(eku.server_auth);
  assert!(!eku.client_auth);

  let validity = leaf.validity();
  assert_eq!(
    validity.not_after.timestamp() - validity.not_before.timestamp(),
    365 * 24 * 60 * 60
  );

  let serial = leaf.raw_serial();
  assert!(!serial.is_empty() && serial.len() <= 16, "{:?}", serial);
  assert_eq!(serial[0] & 0x80, 0);
}

#[test]
fn ip_hosts_get_an_ip_san() {
  use x509_parser::extensions::GeneralName;
  use x509_parser::parse_x509_certificate;

  let ca = CertificateAuthority::generate("snare integration root").unwrap();
  let forged = ca.issue("127.0.0.1").unwrap();
  let (_, leaf) = parse_x509_certificate(forged.leaf.as_ref()).unwrap();
  let san = leaf.subject_alternative_name().unwrap().unwrap();
  assert!(san
    .value
    .general_names
    .iter()
    .all(|name| matches!(name, GeneralName::IPAddress(ip) if *ip == [127u8, 0, 0, 1])));
}

#[test]
fn serials_differ_between_leaves() {
  use x509_parser::parse_x509_certificate;

  let ca = CertificateAuthority::generate("snare integration root").unwrap();
  let first = ca.issue("a.test").unwrap();
  let second = ca.issue("a.test").unwrap();
  let (_, first) = parse_x509_certificate(first.leaf.as_ref()).unwrap();
  let (_, second) = parse_x509_certificate(second.leaf.as_ref()).unwrap();
  assert_ne!(first.raw_serial(), second.raw_serial());
}

#[tokio::test]
async fn ca_files_round_trip_through_disk() {
  let dir = std::env::temp_dir().join(format!("snare-it-ca-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let cert = dir.join("server.crt");
  let key = dir.join("server.key");
  let ca = CertificateAuthority::generate("snare integration root").unwrap();
  ca.write_pem(&cert, &key).await.unwrap();
  let loaded = CertificateAuthority::load_root(&cert, &key).await.unwrap();
  assert_eq!(loaded.root_der(), ca.root_der());
  assert!(loaded.issue("example.com").is_ok());
  std::fs::remove_dir_all(&dir).ok();
}
