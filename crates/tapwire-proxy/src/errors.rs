use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("certificate authority failure: {0}")]
    CertificateAuthority(#[from] tapwire_tls::CaError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
