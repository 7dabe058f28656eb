//! Cluster PKI generated on the operator machine.
//!
//! The cluster CAs (kubernetes, front-proxy, etcd) and the service-account
//! key pair are created once and kept under the cluster's local state
//! directory. Later passes load them again so joined masters keep trusting
//! the same roots; only the API server serving certificate is re-issued,
//! because its SANs follow the master list.
//!
//! kubeadm fills in whatever leaf material is missing from
//! `/etc/kubernetes/pki` (etcd serving/peer certs and the kubelet's client
//! config), so only the pieces whose contents keel controls are produced here.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// Validity of generated CA certificates (10 years).
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity of generated leaf certificates (1 year).
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Cluster CA certificate, relative to the PKI directory.
pub const CA_CERT: &str = "ca.crt";
/// Cluster CA key.
pub const CA_KEY: &str = "ca.key";

/// The three roots kubeadm expects, as (file stem, common name).
const AUTHORITIES: [(&str, &str); 3] = [
    ("ca", "kubernetes"),
    ("front-proxy-ca", "front-proxy-ca"),
    ("etcd/ca", "etcd-ca"),
];

/// PKI errors.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation failed.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Certificate or key parsing error.
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PkiError> for keel_common::Error {
    fn from(e: PkiError) -> Self {
        keel_common::Error::pki(e.to_string())
    }
}

/// Result type for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn
}

/// Parse PEM-encoded data and return the DER bytes.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// `sha256:<hex>` over the certificate's SubjectPublicKeyInfo.
///
/// This is the value kubeadm expects in `--discovery-token-ca-cert-hash`.
pub fn discovery_hash(ca_cert_pem: &str) -> Result<String> {
    let der = parse_pem(ca_cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::Parse(format!("failed to parse CA certificate: {}", e)))?;
    let digest = Sha256::digest(cert.public_key().raw);
    Ok(format!("sha256:{:x}", digest))
}

/// A certificate and its private key, both PEM.
#[derive(Clone)]
pub struct CertificatePair {
    /// Certificate PEM.
    pub cert_pem: String,
    /// Private key PEM.
    pub key_pem: String,
}

/// Which side of TLS a leaf certificate serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Usage {
    /// TLS server.
    Server,
    /// TLS client.
    Client,
}

/// A self-signed certificate authority.
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA.
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {}", e)))?;
        parse_pem(cert_pem)?;
        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate PEM.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key PEM.
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue a leaf certificate signed by this CA.
    ///
    /// SAN entries that parse as IP addresses become IP SANs, the rest DNS
    /// names.
    pub fn issue(
        &self,
        common_name: &str,
        organization: Option<&str>,
        sans: &[String],
        usage: Usage,
    ) -> Result<CertificatePair> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, organization);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match usage {
            Usage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Usage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.clone())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGeneration(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate key for {}: {}", common_name, e))
        })?;
        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(&key, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign {}: {}", common_name, e))
        })?;

        Ok(CertificatePair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

/// Inputs that shape the generated PKI.
#[derive(Clone, Debug)]
pub struct PkiParams {
    /// API server SANs (loopback, VIP, API domain, masters, extras).
    pub sans: Vec<String>,
    /// Service CIDR; its first address is the in-cluster API service IP.
    pub service_cidr: String,
    /// Cluster DNS domain.
    pub dns_domain: String,
}

/// Complete set of PKI files, keyed by path relative to the PKI directory.
pub struct ClusterPki {
    ca: CertificateAuthority,
    files: BTreeMap<String, String>,
}

impl ClusterPki {
    /// Load the roots from `dir` (creating any that are missing) and issue
    /// the leaf certificates for `params`.
    pub fn load_or_generate(dir: &Path, params: &PkiParams) -> Result<Self> {
        let mut files = BTreeMap::new();
        let mut cluster_ca = None;

        for (stem, common_name) in AUTHORITIES {
            let cert_path = dir.join(format!("{stem}.crt"));
            let key_path = dir.join(format!("{stem}.key"));
            let ca = if cert_path.is_file() && key_path.is_file() {
                debug!(authority = stem, "loading existing CA");
                CertificateAuthority::from_pem(
                    &std::fs::read_to_string(&cert_path)?,
                    &std::fs::read_to_string(&key_path)?,
                )?
            } else {
                info!(authority = stem, "generating CA");
                CertificateAuthority::new(common_name)?
            };
            files.insert(format!("{stem}.crt"), ca.ca_cert_pem().to_string());
            files.insert(format!("{stem}.key"), ca.ca_key_pem().to_string());
            if stem == "ca" {
                cluster_ca = Some(ca);
            } else if stem == "front-proxy-ca" {
                let client = ca.issue("front-proxy-client", None, &[], Usage::Client)?;
                files.insert("front-proxy-client.crt".into(), client.cert_pem);
                files.insert("front-proxy-client.key".into(), client.key_pem);
            }
        }
        let ca = cluster_ca
            .ok_or_else(|| PkiError::CertificateGeneration("cluster CA missing".into()))?;

        let sa_key_path = dir.join("sa.key");
        let sa_key = if sa_key_path.is_file() {
            let pem = std::fs::read_to_string(&sa_key_path)?;
            KeyPair::from_pem(&pem)
                .map_err(|e| PkiError::Parse(format!("failed to parse sa.key: {}", e)))?
        } else {
            KeyPair::generate().map_err(|e| {
                PkiError::KeyGeneration(format!("failed to generate service account key: {}", e))
            })?
        };
        files.insert("sa.key".into(), sa_key.serialize_pem());
        files.insert("sa.pub".into(), sa_key.public_key_pem());

        let apiserver = ca.issue(
            "kube-apiserver",
            None,
            &apiserver_sans(params)?,
            Usage::Server,
        )?;
        files.insert("apiserver.crt".into(), apiserver.cert_pem);
        files.insert("apiserver.key".into(), apiserver.key_pem);

        let kubelet_client = ca.issue(
            "kube-apiserver-kubelet-client",
            Some("system:masters"),
            &[],
            Usage::Client,
        )?;
        files.insert("apiserver-kubelet-client.crt".into(), kubelet_client.cert_pem);
        files.insert("apiserver-kubelet-client.key".into(), kubelet_client.key_pem);

        Ok(Self { ca, files })
    }

    /// Write every file under `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        for (rel, contents) in &self.files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, contents)?;
        }
        Ok(())
    }

    /// Cluster CA.
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Relative path to PEM contents.
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    /// Discovery hash of the cluster CA.
    pub fn discovery_hash(&self) -> Result<String> {
        discovery_hash(self.ca.ca_cert_pem())
    }
}

/// First usable address of a CIDR (`10.96.0.0/22` gives `10.96.0.1`).
pub fn first_service_ip(cidr: &str) -> Result<IpAddr> {
    let base = cidr.split('/').next().unwrap_or(cidr);
    let ip: IpAddr = base
        .parse()
        .map_err(|_| PkiError::Parse(format!("invalid service CIDR '{cidr}'")))?;
    Ok(match ip {
        IpAddr::V4(v4) => IpAddr::V4(u32::from(v4).wrapping_add(1).into()),
        IpAddr::V6(v6) => IpAddr::V6(u128::from(v6).wrapping_add(1).into()),
    })
}

fn apiserver_sans(params: &PkiParams) -> Result<Vec<String>> {
    let mut sans = params.sans.clone();
    sans.push(first_service_ip(&params.service_cidr)?.to_string());
    sans.extend([
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{}", params.dns_domain),
    ]);
    let mut seen = std::collections::HashSet::new();
    sans.retain(|s| seen.insert(s.clone()));
    Ok(sans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PkiParams {
        PkiParams {
            sans: vec![
                "127.0.0.1".into(),
                "10.103.97.2".into(),
                "apiserver.cluster.local".into(),
                "10.0.0.1".into(),
            ],
            service_cidr: "10.96.0.0/22".into(),
            dns_domain: "cluster.local".into(),
        }
    }

    fn san_strings(cert_pem: &str) -> Vec<String> {
        let der = parse_pem(cert_pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let ext = cert.subject_alternative_name().unwrap().unwrap();
        ext.value
            .general_names
            .iter()
            .map(|name| match name {
                GeneralName::DNSName(d) => d.to_string(),
                GeneralName::IPAddress(bytes) if bytes.len() == 4 => {
                    std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string()
                }
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn ca_can_be_created() {
        let ca = CertificateAuthority::new("kubernetes").expect("CA creation should succeed");
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn service_ip_is_first_address() {
        assert_eq!(
            first_service_ip("10.96.0.0/22").unwrap().to_string(),
            "10.96.0.1"
        );
        assert_eq!(first_service_ip("fd00::/108").unwrap().to_string(), "fd00::1");
        assert!(first_service_ip("not-a-cidr").is_err());
    }

    #[test]
    fn discovery_hash_is_stable_for_a_ca() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let first = discovery_hash(ca.ca_cert_pem()).unwrap();
        let second = discovery_hash(ca.ca_cert_pem()).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("sha256:"));
        assert_eq!(first.len(), "sha256:".len() + 64);

        let other = CertificateAuthority::new("kubernetes").unwrap();
        assert_ne!(first, discovery_hash(other.ca_cert_pem()).unwrap());
    }

    #[test]
    fn apiserver_cert_carries_every_san() {
        let dir = tempfile::tempdir().unwrap();
        let pki = ClusterPki::load_or_generate(dir.path(), &params()).unwrap();
        let sans = san_strings(&pki.files()["apiserver.crt"]);
        for expected in [
            "127.0.0.1",
            "10.103.97.2",
            "apiserver.cluster.local",
            "10.0.0.1",
            "10.96.0.1",
            "kubernetes.default.svc.cluster.local",
        ] {
            assert!(sans.contains(&expected.to_string()), "missing {expected}: {sans:?}");
        }
    }

    #[test]
    fn generates_the_files_kubeadm_reads() {
        let dir = tempfile::tempdir().unwrap();
        let pki = ClusterPki::load_or_generate(dir.path(), &params()).unwrap();
        for name in [
            "ca.crt",
            "ca.key",
            "apiserver.crt",
            "apiserver-kubelet-client.key",
            "front-proxy-ca.crt",
            "front-proxy-client.crt",
            "etcd/ca.crt",
            "etcd/ca.key",
            "sa.key",
            "sa.pub",
        ] {
            assert!(pki.files().contains_key(name), "missing {name}");
        }
        assert!(pki.files()["sa.pub"].contains("PUBLIC KEY"));
    }

    /// Story: a second pass reuses the roots so joined masters keep trusting them.
    #[test]
    fn story_roots_survive_between_passes() {
        let dir = tempfile::tempdir().unwrap();
        let first = ClusterPki::load_or_generate(dir.path(), &params()).unwrap();
        first.write_to(dir.path()).unwrap();
        assert!(dir.path().join("etcd/ca.crt").is_file());

        let mut grown = params();
        grown.sans.push("10.0.0.2".into());
        let second = ClusterPki::load_or_generate(dir.path(), &grown).unwrap();

        assert_eq!(first.ca().ca_cert_pem(), second.ca().ca_cert_pem());
        assert_eq!(first.files()["sa.key"], second.files()["sa.key"]);
        assert_eq!(first.discovery_hash().unwrap(), second.discovery_hash().unwrap());
        assert!(san_strings(&second.files()["apiserver.crt"]).contains(&"10.0.0.2".to_string()));
    }

    #[test]
    fn corrupt_ca_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.crt"), "garbage").unwrap();
        std::fs::write(dir.path().join("ca.key"), "garbage").unwrap();
        let err = ClusterPki::load_or_generate(dir.path(), &params())
            .err()
            .unwrap();
        assert!(matches!(err, PkiError::Parse(_)));
        let shared: keel_common::Error = err.into();
        assert!(matches!(shared, keel_common::Error::Pki { .. }));
    }
}
