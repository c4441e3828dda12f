use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SignatureAlgorithm,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

pub const CA_CERT_FILE_NAME: &str = "tapwire-ca.pem";
pub const CA_KEY_FILE_NAME: &str = "tapwire-ca-key.pem";

const ROOT_COMMON_NAME: &str = "tapwire root CA";
const ROOT_ORGANIZATION: &str = "tapwire";
const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
const VALIDITY_BACKDATE_HOURS: i64 = 1;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("certificate cache lock poisoned")]
    CacheLockPoisoned,
}

/// Returns true when `prefix` opens a TLS record: content type handshake
/// (0x16) followed by a 3.x record version. TLS 1.3 still writes 0x0303 on
/// the wire, so this covers SSL 3.0 through TLS 1.3.
pub fn is_tls_record_prefix(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 && prefix[2] <= 0x03
}

/// Long-lived signing root plus the per-hostname leaf cache. One instance
/// is shared by every TLS session the proxy terminates.
pub struct CertificateAuthority {
    state: Mutex<CaState>,
    leaves_issued: AtomicU64,
}

struct CaState {
    root: RootMaterial,
    leaf_cache: HashMap<String, Arc<CertifiedKey>>,
}

struct RootMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    signing_algorithm: &'static SignatureAlgorithm,
}

impl CertificateAuthority {
    /// Loads the root key and certificate from `root_dir`, generating and
    /// persisting a fresh pair when neither file exists yet. A directory
    /// holding only one of the two files is rejected rather than silently
    /// regenerated over.
    pub fn open_or_create(root_dir: impl AsRef<Path>) -> Result<Self, CaError> {
        let cert_path = root_dir.as_ref().join(CA_CERT_FILE_NAME);
        let key_path = root_dir.as_ref().join(CA_KEY_FILE_NAME);

        let root = match (cert_path.exists(), key_path.exists()) {
            (true, true) => load_root_material(&cert_path, &key_path)?,
            (false, false) => {
                let root = generate_root_material()?;
                persist_root_material(&cert_path, &key_path, &root)?;
                root
            }
            _ => {
                return Err(CaError::InvalidMaterial(format!(
                    "{} and {} must both exist or both be absent",
                    cert_path.display(),
                    key_path.display()
                )));
            }
        };

        Ok(Self {
            state: Mutex::new(CaState {
                root,
                leaf_cache: HashMap::new(),
            }),
            leaves_issued: AtomicU64::new(0),
        })
    }

    /// Returns the certified key presented for `host`, minting and caching
    /// it on first request. The state lock spans cache lookup and minting,
    /// so concurrent handshakes for one hostname share a single mint.
    pub fn certified_key_for_host(&self, host: &str) -> Result<Arc<CertifiedKey>, CaError> {
        let normalized_host = normalize_host(host);
        let mut state = self.state.lock().map_err(|_| CaError::CacheLockPoisoned)?;

        if let Some(cached) = state.leaf_cache.get(&normalized_host) {
            return Ok(Arc::clone(cached));
        }

        let certified = issue_leaf(&state.root, &normalized_host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        state
            .leaf_cache
            .insert(normalized_host, Arc::clone(&certified));
        Ok(certified)
    }

    pub fn ca_certificate_pem(&self) -> Result<String, CaError> {
        let state = self.state.lock().map_err(|_| CaError::CacheLockPoisoned)?;
        Ok(state.root.cert_pem.clone())
    }

    pub fn issued_leaf_count(&self) -> u64 {
        self.leaves_issued.load(Ordering::Relaxed)
    }
}

/// Server config for the embedded TLS server: the certificate comes from
/// the authority per ClientHello SNI, and ALPN is pinned to http/1.1 so
/// HTTP/2 is never negotiated with the client.
pub fn server_config_with_authority(authority: Arc<CertificateAuthority>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(LeafCertResolver { authority }));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Client config for upstream dials: webpki roots by default, or all
/// verification disabled when `insecure_skip_verify` is set. ALPN is
/// pinned to http/1.1 on this leg as well.
pub fn upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DisabledCertVerification))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

struct LeafCertResolver {
    authority: Arc<CertificateAuthority>,
}

impl fmt::Debug for LeafCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LeafCertResolver")
    }
}

impl ResolvesServerCert for LeafCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?;
        match self.authority.certified_key_for_host(host) {
            Ok(certified) => Some(certified),
            Err(error) => {
                tracing::warn!(host, %error, "leaf certificate issuance failed");
                None
            }
        }
    }
}

fn generate_root_material() -> Result<RootMaterial, CaError> {
    let root_key = KeyPair::generate()?;
    let signing_algorithm = root_key.algorithm();
    let key_pem = root_key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(VALIDITY_BACKDATE_HOURS);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, ROOT_COMMON_NAME);
    distinguished_name.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = distinguished_name;

    let root_cert = params.self_signed(&root_key)?;
    let cert_pem = root_cert.pem();
    let cert_der = root_cert.der().clone();
    let issuer = Issuer::new(params, root_key);

    Ok(RootMaterial {
        issuer,
        cert_der,
        cert_pem,
        key_pem,
        signing_algorithm,
    })
}

fn load_root_material(cert_path: &Path, key_path: &Path) -> Result<RootMaterial, CaError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;

    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to parse CA certificate PEM from {}: {error}",
            cert_path.display()
        ))
    })?;
    let root_key = KeyPair::from_pem(&key_pem)?;
    let signing_algorithm = root_key.algorithm();
    let issuer = Issuer::from_ca_cert_der(&cert_der, root_key).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to parse issuer metadata from {}: {error}",
            cert_path.display()
        ))
    })?;

    Ok(RootMaterial {
        issuer,
        cert_der,
        cert_pem,
        key_pem,
        signing_algorithm,
    })
}

fn persist_root_material(
    cert_path: &Path,
    key_path: &Path,
    root: &RootMaterial,
) -> Result<(), CaError> {
    ensure_parent_exists(cert_path)?;
    ensure_parent_exists(key_path)?;
    fs::write(cert_path, root.cert_pem.as_bytes())?;
    fs::write(key_path, root.key_pem.as_bytes())?;
    Ok(())
}

fn ensure_parent_exists(path: &Path) -> Result<(), CaError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn issue_leaf(root: &RootMaterial, host: &str) -> Result<Arc<CertifiedKey>, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(VALIDITY_BACKDATE_HOURS);
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    // Leaf keys use the same algorithm as the root key, whether that root
    // was generated here or imported from disk.
    let leaf_key = KeyPair::generate_for(root.signing_algorithm)?;
    let leaf_cert = params.signed_by(&leaf_key, &root.issuer)?;

    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let signing_key = any_supported_type(&private_key)
        .map_err(|error| CaError::InvalidMaterial(format!("unusable leaf key: {error}")))?;

    let chain = vec![leaf_cert.der().clone(), root.cert_der.clone()];
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

#[derive(Debug)]
struct DisabledCertVerification;

impl ServerCertVerifier for DisabledCertVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    use super::{
        is_tls_record_prefix, upstream_client_config, CertificateAuthority, CA_CERT_FILE_NAME,
        CA_KEY_FILE_NAME,
    };

    #[test]
    fn classifies_tls_record_prefixes() {
        assert!(is_tls_record_prefix(&[0x16, 0x03, 0x01]));
        assert!(is_tls_record_prefix(&[0x16, 0x03, 0x00]));
        assert!(is_tls_record_prefix(&[0x16, 0x03, 0x03, 0x00, 0x05]));
        assert!(!is_tls_record_prefix(&[0x16, 0x03]));
        assert!(!is_tls_record_prefix(&[0x16, 0x02, 0x01]));
        assert!(!is_tls_record_prefix(&[0x16, 0x03, 0x04]));
        assert!(!is_tls_record_prefix(b"GET"));
        assert!(!is_tls_record_prefix(b""));
    }

    #[test]
    fn mints_one_leaf_per_host_and_reuses_it() {
        let temp_dir = unique_temp_dir("tapwire-ca-cache");
        let authority = CertificateAuthority::open_or_create(&temp_dir).expect("open authority");

        let first = authority
            .certified_key_for_host("api.example.com")
            .expect("first leaf");
        let second = authority
            .certified_key_for_host("API.EXAMPLE.COM")
            .expect("second leaf");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(authority.issued_leaf_count(), 1);

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn concurrent_mints_for_one_host_share_a_leaf() {
        let temp_dir = unique_temp_dir("tapwire-ca-singleflight");
        let authority =
            Arc::new(CertificateAuthority::open_or_create(&temp_dir).expect("open authority"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let authority = Arc::clone(&authority);
                std::thread::spawn(move || {
                    authority
                        .certified_key_for_host("concurrent.example.com")
                        .expect("leaf")
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("mint thread");
        }

        assert_eq!(authority.issued_leaf_count(), 1);

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn leaf_carries_cn_and_dns_san_for_host() {
        let temp_dir = unique_temp_dir("tapwire-ca-san");
        let authority = CertificateAuthority::open_or_create(&temp_dir).expect("open authority");

        let leaf = authority
            .certified_key_for_host("api.example.com")
            .expect("leaf");
        let (_, cert) = parse_x509_certificate(leaf.cert[0].as_ref()).expect("parse leaf");

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .expect("commonName")
            .as_str()
            .expect("commonName utf8");
        assert_eq!(cn, "api.example.com");

        let san = cert
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "api.example.com")));

        let validity_secs = cert.validity().not_after.timestamp()
            - cert.validity().not_before.timestamp();
        assert!(
            validity_secs <= 366 * 24 * 60 * 60,
            "leaf validity window exceeds one year: {validity_secs}s"
        );

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn leaf_for_ip_host_carries_ip_san() {
        let temp_dir = unique_temp_dir("tapwire-ca-ip");
        let authority = CertificateAuthority::open_or_create(&temp_dir).expect("open authority");

        let leaf = authority.certified_key_for_host("127.0.0.1").expect("leaf");
        let (_, cert) = parse_x509_certificate(leaf.cert[0].as_ref()).expect("parse leaf");
        let san = cert
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == [127, 0, 0, 1])));

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn leaf_chains_to_the_persisted_root() {
        let temp_dir = unique_temp_dir("tapwire-ca-chain");
        let authority = CertificateAuthority::open_or_create(&temp_dir).expect("open authority");

        let leaf = authority
            .certified_key_for_host("chained.example.com")
            .expect("leaf");
        assert_eq!(leaf.cert.len(), 2, "leaf chain must include the root");

        let (_, leaf_cert) = parse_x509_certificate(leaf.cert[0].as_ref()).expect("parse leaf");
        let (_, root_cert) = parse_x509_certificate(leaf.cert[1].as_ref()).expect("parse root");
        assert_eq!(leaf_cert.issuer(), root_cert.subject());

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn reopens_persisted_root_material_identically() {
        let temp_dir = unique_temp_dir("tapwire-ca-reload");

        let first = CertificateAuthority::open_or_create(&temp_dir).expect("first open");
        let first_pem = first.ca_certificate_pem().expect("first pem");
        drop(first);

        let second = CertificateAuthority::open_or_create(&temp_dir).expect("second open");
        let second_pem = second.ca_certificate_pem().expect("second pem");
        assert_eq!(first_pem, second_pem);

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn rejects_half_present_root_material() {
        let temp_dir = unique_temp_dir("tapwire-ca-half");
        fs::create_dir_all(&temp_dir).expect("create temp dir");
        fs::write(temp_dir.join(CA_CERT_FILE_NAME), b"not a real cert").expect("write cert");
        assert!(!temp_dir.join(CA_KEY_FILE_NAME).exists());

        let error = match CertificateAuthority::open_or_create(&temp_dir) {
            Ok(_) => panic!("half-present CA material unexpectedly accepted"),
            Err(error) => error,
        };
        assert!(
            error.to_string().contains("both exist or both be absent"),
            "{error}"
        );

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn builds_upstream_client_configs_for_both_verification_modes() {
        let secure = upstream_client_config(false);
        assert_eq!(secure.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let insecure = upstream_client_config(true);
        assert_eq!(insecure.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
        let dir = std::env::temp_dir().join(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            now.as_nanos()
        ));
        assert!(!Path::new(&dir).exists());
        dir
    }
}
