//! Certificate Authority (CA) for forging per-host server certificates
//!
//! The root certificate and key are provisioned out of band and loaded once
//! at startup. Every TLS handshake gets a freshly generated leaf.

use crate::errors::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tokio::fs;

/// Leaf validity in days
const LEAF_TTL_DAYS: i64 = 365;
/// Root validity in days, for generated roots
const ROOT_TTL_DAYS: i64 = 3650;

/// A leaf certificate issued for one hostname.
///
/// Owned by the connection that asked for it and never reused.
#[derive(Debug)]
pub struct ForgedCertificate {
  /// the leaf in DER
  pub leaf: CertificateDer<'static>,
  /// `[leaf, root]`
  pub chain: Vec<CertificateDer<'static>>,
  /// the leaf's private key
  pub key: PrivatePkcs8KeyDer<'static>,
}

impl ForgedCertificate {
  /// The private key in the form rustls configs take.
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(self.key.clone_key())
  }
}

/// Root CA used to sign forged certificates
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_der: CertificateDer<'static>,
  root_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("root_der", &self.root_der.len())
      .finish()
  }
}

impl CertificateAuthority {
  /// Load the root from a PEM certificate file and a PEM PKCS#8 key file.
  pub async fn load_root(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_pem = fs::read(cert_path.as_ref()).await?;
    let key_pem = fs::read(key_path.as_ref()).await?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build the root from in-memory PEM.
  ///
  /// The first PEM block of each input must be a `CERTIFICATE` and a
  /// `PRIVATE KEY` respectively.
  pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
    let root_der = match rustls_pemfile::read_one(&mut &cert_pem[..]) {
      Ok(Some(Item::X509Certificate(der))) => der,
      Ok(Some(_)) => return Err(Error::decode("expected a CERTIFICATE PEM block")),
      Ok(None) => return Err(Error::decode("no PEM block in root certificate")),
      Err(e) => return Err(Error::decode(format!("root certificate: {}", e))),
    };
    let root_pem = String::from_utf8(cert_pem.to_vec())
      .map_err(|_| Error::decode("root certificate PEM is not utf-8"))?;
    let key_der = match rustls_pemfile::read_one(&mut &key_pem[..]) {
      Ok(Some(Item::Pkcs8Key(der))) => der,
      Ok(Some(_)) => return Err(Error::decode("expected a PRIVATE KEY PEM block")),
      Ok(None) => return Err(Error::decode("no PEM block in root key")),
      Err(e) => return Err(Error::decode(format!("root key: {}", e))),
    };
    let key_pair = KeyPair::try_from(key_der.secret_pkcs8_der())
      .map_err(|e| Error::parse(format!("root key is not usable: {}", e)))?;
    let issuer = Issuer::from_ca_cert_der(&root_der, key_pair)
      .map_err(|e| Error::parse(format!("root certificate is not usable: {}", e)))?;
    Ok(Self {
      issuer,
      root_der,
      root_pem,
    })
  }

  /// Generate a new self-signed root.
  pub fn generate(common_name: &str) -> Result<Self> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "snare");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::key_gen(format!("root key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::sign(format!("self-signing root: {}", e)))?;
    let root_der = cert.der().clone();
    let root_pem = cert.pem();
    let issuer = Issuer::new(params, key_pair);
    Ok(Self {
      issuer,
      root_der,
      root_pem,
    })
  }

  /// Write the root certificate and key as PEM files.
  pub async fn write_pem(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
    fs::write(cert_path.as_ref(), self.root_pem()).await?;
    fs::write(key_path.as_ref(), self.issuer.key().serialize_pem()).await?;
    Ok(())
  }

  /// Forge a leaf certificate for `hostname`.
  pub fn issue(&self, hostname: &str) -> Result<ForgedCertificate> {
    let mut params = CertificateParams::default();

    let mut serial = rand::thread_rng().gen::<[u8; 16]>();
    // keep the DER integer positive
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::sign(format!("invalid hostname for certificate: {}", hostname))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_TTL_DAYS);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
      .map_err(|e| Error::key_gen(format!("leaf key pair for {}: {}", hostname, e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::sign(format!("signing leaf for {}: {}", hostname, e)))?;

    let leaf = cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    Ok(ForgedCertificate {
      chain: vec![leaf.clone(), self.root_der.clone()],
      leaf,
      key,
    })
  }

  /// The root certificate in DER.
  pub fn root_der(&self) -> &CertificateDer<'static> {
    &self.root_der
  }

  /// The root certificate in PEM, for installing into client trust stores.
  pub fn root_pem(&self) -> &str {
    &self.root_pem
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;

  #[test]
  fn generated_root_survives_pem() {
    let ca = CertificateAuthority::generate("snare test root").unwrap();
    let key_pem = ca.issuer.key().serialize_pem();
    let loaded = CertificateAuthority::from_pem(ca.root_pem().as_bytes(), key_pem.as_bytes()).unwrap();
    assert_eq!(loaded.root_der(), ca.root_der());
    // the loaded text is served as it was read
    assert_eq!(loaded.root_pem(), ca.root_pem());
  }

  #[test]
  fn generated_pem_decodes_to_the_root() {
    let ca = CertificateAuthority::generate("snare test root").unwrap();
    assert!(ca.root_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    match rustls_pemfile::read_one(&mut ca.root_pem().as_bytes()).unwrap() {
      Some(Item::X509Certificate(der)) => assert_eq!(&der, ca.root_der()),
      other => panic!("unexpected PEM item: {:?}", other),
    }
  }

  #[test]
  fn issue_returns_leaf_and_root() {
    let ca = CertificateAuthority::generate("snare test root").unwrap();
    let forged = ca.issue("example.com").unwrap();
    assert_eq!(forged.chain.len(), 2);
    assert_eq!(forged.chain[0], forged.leaf);
    assert_eq!(&forged.chain[1], ca.root_der());
  }

  #[test]
  fn every_issue_is_fresh() {
    let ca = CertificateAuthority::generate("snare test root").unwrap();
    let a = ca.issue("example.com").unwrap();
    let b = ca.issue("example.com").unwrap();
    assert_ne!(a.leaf, b.leaf);
    assert_ne!(a.key.secret_pkcs8_der(), b.key.secret_pkcs8_der());
  }

  #[test]
  fn wrong_pem_type_is_a_decode_error() {
    let ca = CertificateAuthority::generate("snare test root").unwrap();
    let key_pem = ca.issuer.key().serialize_pem();
    // certificate where the key belongs
    let err = CertificateAuthority::from_pem(ca.root_pem().as_bytes(), ca.root_pem().as_bytes())
      .unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
    let err = CertificateAuthority::from_pem(b"not pem at all", key_pem.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
  }

  #[test]
  fn garbage_der_is_a_parse_error() {
    let ca = CertificateAuthority::generate("snare test root").unwrap();
    let key_pem = ca.issuer.key().serialize_pem();
    let bogus = format!(
      "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
      STANDARD.encode(b"definitely not a certificate")
    );
    let err = CertificateAuthority::from_pem(bogus.as_bytes(), key_pem.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[tokio::test]
  async fn missing_file_is_an_io_error() {
    let dir = std::env::temp_dir().join("snare-ca-missing");
    let err = CertificateAuthority::load_root(dir.join("nope.crt"), dir.join("nope.key"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
  }
}
