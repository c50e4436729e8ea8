//! The two internal listeners and everything a request goes through on its way out and back.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Settings;
use crate::proxy::client_tls::UpstreamTls;
use crate::proxy::registry::RelayRegistry;
use crate::state::State;

pub mod context;
pub mod dispatch;
pub mod headers;
pub mod hooks;
mod liveness;
mod request;
mod response;
pub(crate) mod server;
pub mod websocket;

use context::Scheme;
use liveness::Liveness;

/// What every inbound HTTP connection handler shares.
pub(crate) struct HttpShared {
    pub settings: Arc<Settings>,
    pub state: Arc<RwLock<State>>,
    pub upstream: UpstreamTls,
    pub registry: Arc<RelayRegistry>,
}

/// One accepted connection on an internal listener.
pub(crate) struct ConnectionInfo {
    pub scheme: Scheme,
    /// The SOCKS client behind the relay when known, else the loopback peer.
    pub peer_addr: Option<SocketAddr>,
    pub liveness: Liveness,
}
