#![warn(missing_docs)]

//! # snare
//!
//! An intercepting HTTP/HTTPS forward proxy.
//!
//! Every request that passes through is turned into a [`CapturedRequest`],
//! every answer into a [`CapturedResponse`], and both are handed to a
//! [`Storage`] so they can be listed and replayed later.
//!
//! - Plain HTTP is forwarded by the proxy itself, see [`OriginClient`].
//! - `CONNECT` tunnels are intercepted: the proxy forges a certificate for
//!   the requested host with its own [`CertificateAuthority`], terminates the
//!   client's TLS session and opens its own towards the origin, then relays
//!   plaintext between the two while keeping a copy.
//!
//! ## Running a proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use snare::{InterceptProxy, MemoryStorage, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> snare::Result<()> {
//!   let config = ProxyConfig::default();
//!   let proxy = InterceptProxy::load(config, Arc::new(MemoryStorage::new())).await?;
//!   proxy.run().await
//! }
//! ```
//!
//! Clients have to trust the root certificate (`GET /api/ca` on the admin
//! listener) for HTTPS interception to go unnoticed.
//!
pub mod admin;
mod body;
/// Certificate authority and forged leaf certificates
pub mod ca;
mod client;
mod connector;
/// Cookie parsing helpers
pub mod cookies;
mod errors;
mod proxy;
/// Canonical request/response records
pub mod record;
pub mod relay;
mod server;
mod socket;
pub mod storage;
pub mod tls;
pub mod tunnel;
pub mod wire;

pub use body::Body;
pub use ca::{CertificateAuthority, ForgedCertificate};
pub use client::{OriginClient, OriginResponse};
pub use connector::{Connector, ConnectorBuilder};
pub use cookies::CapturedCookie;
pub use errors::{Error, Result};
pub use proxy::{InterceptProxy, ProxyConfig};
pub use record::{CapturedRequest, CapturedResponse};
pub use server::ProxyServer;
pub use socket::Socket;
pub use storage::{MemoryStorage, Storage};
pub use tls::TlsResolver;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
