mod addon;
mod body;
mod connection;
mod errors;
mod flow;
mod http1;
mod interceptor;
mod options;
mod pipe;
mod server;
mod websocket;

pub use addon::Addon;
pub use connection::{ClientInfo, ConnContext};
pub use errors::ProxyError;
pub use flow::{Flow, Request, Response};
pub use options::{Options, DEFAULT_STREAM_LARGE_BODIES};
pub use server::Proxy;
