use tapwire_proxy::{Options, Proxy, ProxyError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    let mut opts = Options::default();
    if let Some(listen_addr) = std::env::args().nth(1) {
        opts.listen_addr = listen_addr;
    }

    let default_directive = match opts.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    Proxy::new(opts)?.run().await
}
