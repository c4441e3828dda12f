use std::net::SocketAddr;
use std::path::PathBuf;

use crate::errors::ProxyError;

pub const DEFAULT_STREAM_LARGE_BODIES: i64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Log verbosity tier: 0 info, 1 debug, 2 and up trace.
    pub debug: u8,
    /// Address the plaintext proxy listener binds to.
    pub listen_addr: String,
    /// Bodies at or above this many bytes are relayed in streaming mode
    /// instead of being buffered for the body-aware hooks. Values of zero
    /// or below select the 5 MiB default.
    pub stream_large_bodies: i64,
    /// Skip certificate verification on upstream TLS dials.
    pub ssl_insecure: bool,
    /// Directory holding the root CA key and certificate.
    pub ca_root_path: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debug: 0,
            listen_addr: "127.0.0.1:8080".to_string(),
            stream_large_bodies: 0,
            ssl_insecure: false,
            ca_root_path: PathBuf::from("./certs"),
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ProxyError::InvalidConfig(format!(
                "listen_addr {:?} is not a socket address",
                self.listen_addr
            )));
        }
        if self.ca_root_path.as_os_str().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "ca_root_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn body_buffer_limit(&self) -> usize {
        if self.stream_large_bodies <= 0 {
            DEFAULT_STREAM_LARGE_BODIES as usize
        } else {
            self.stream_large_bodies as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Options, DEFAULT_STREAM_LARGE_BODIES};

    #[test]
    fn default_options_validate() {
        Options::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn non_positive_stream_threshold_selects_the_default() {
        let mut options = Options::default();
        assert_eq!(
            options.body_buffer_limit(),
            DEFAULT_STREAM_LARGE_BODIES as usize
        );

        options.stream_large_bodies = -4;
        assert_eq!(
            options.body_buffer_limit(),
            DEFAULT_STREAM_LARGE_BODIES as usize
        );

        options.stream_large_bodies = 1024;
        assert_eq!(options.body_buffer_limit(), 1024);
    }

    #[test]
    fn rejects_unparseable_listen_addr() {
        let options = Options {
            listen_addr: "not-an-address".to_string(),
            ..Options::default()
        };
        let error = options.validate().expect_err("must reject");
        assert!(error.to_string().contains("listen_addr"), "{error}");
    }
}
