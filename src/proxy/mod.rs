use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use fast_socks5::SocksError;
use fast_socks5::server::SocksServerError;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::error::InterceptError;
use crate::http::hooks::{RequestHook, ResponseHook, WebSocketHook};
use crate::http::{server, HttpShared};
use crate::state::{self, State};

pub mod client_tls;
mod protocol_detect;
pub mod registry;
pub mod relay;
mod server_tls;
mod socks5;
pub mod udp;

use client_tls::UpstreamTls;
use registry::RelayRegistry;
use relay::TcpModifier;
use socks5::serve_socks5;
use udp::UdpHook;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("SOCKS5 error: {0}")]
    SocksError(#[from] SocksError),
    #[error("SOCKS5 negotiation failed: {0}")]
    Negotiation(#[from] SocksServerError),
    #[error(transparent)]
    Intercept(#[from] InterceptError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What every SOCKS session shares.
pub(crate) struct ProxyShared {
    pub settings: Arc<Settings>,
    pub state: Arc<RwLock<State>>,
    pub registry: Arc<RelayRegistry>,
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
}

/// A running interception service: SOCKS5 front-end, internal listeners and their hooks.
///
/// Dropping it shuts everything down.
pub struct Interceptor {
    settings: Arc<Settings>,
    state: Arc<RwLock<State>>,
    registry: Arc<RelayRegistry>,
    socks_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

async fn bind(addr: SocketAddr, what: &str) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind the {what} listener on {addr}"))?;
    let bound = listener.local_addr()?;
    Ok((listener, bound))
}

impl Interceptor {
    /// Binds whatever has a port configured and starts serving. Port 0 picks an ephemeral one.
    pub async fn start(settings: Settings) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let state = state::init(&settings)?;

        let acceptor = match settings.https_addr() {
            Some(_) => Some(server_tls::require_tls_acceptor(&state)?),
            None => None,
        };
        let upstream = UpstreamTls::new(state.root_store.as_deref())?;

        let state = Arc::new(RwLock::new(state));
        let registry = Arc::new(RelayRegistry::new(settings.socks_log));
        let shutdown = CancellationToken::new();

        let http_shared = Arc::new(HttpShared {
            settings: settings.clone(),
            state: state.clone(),
            upstream,
            registry: registry.clone(),
        });

        let http_addr = match settings.http_addr() {
            Some(addr) => {
                let (listener, bound) = bind(addr, "HTTP").await?;
                tokio::spawn(server::serve(listener, None, http_shared.clone(), shutdown.clone()));
                info!("HTTP listener on {bound}");
                Some(bound)
            }
            None => None,
        };

        let https_addr = match (settings.https_addr(), acceptor) {
            (Some(addr), Some(acceptor)) => {
                let (listener, bound) = bind(addr, "HTTPS").await?;
                tokio::spawn(server::serve(listener, Some(acceptor), http_shared.clone(), shutdown.clone()));
                info!("HTTPS listener on {bound}");
                Some(bound)
            }
            _ => None,
        };

        let socks_addr = match settings.socks_addr() {
            Some(addr) => {
                let (listener, bound) = bind(addr, "SOCKS5").await?;
                let shared = Arc::new(ProxyShared {
                    settings: settings.clone(),
                    state: state.clone(),
                    registry: registry.clone(),
                    http_addr,
                    https_addr,
                });
                tokio::spawn(serve_socks(listener, shared, shutdown.clone()));
                info!("SOCKS5 front-end on {bound}");
                Some(bound)
            }
            None => None,
        };

        Ok(Self {
            settings,
            state,
            registry,
            socks_addr,
            http_addr,
            https_addr,
            shutdown,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    pub fn http_port(&self) -> Option<u16> {
        self.http_addr.map(|addr| addr.port())
    }

    pub fn https_port(&self) -> Option<u16> {
        self.https_addr.map(|addr| addr.port())
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    pub async fn set_http_hooks(
        &self,
        request: Option<Arc<dyn RequestHook>>,
        response: Option<Arc<dyn ResponseHook>>,
    ) {
        let mut state = self.state.write().await;
        state.request_hook = request;
        state.response_hook = response;
    }

    pub async fn set_websocket_hook(&self, hook: Option<Arc<dyn WebSocketHook>>) {
        self.state.write().await.websocket_hook = hook;
    }

    pub async fn set_udp_hook(&self, hook: Option<Arc<dyn UdpHook>>) {
        self.state.write().await.udp_hook = hook;
    }

    /// Modifiers apply to relays started afterwards.
    pub async fn set_tcp_modifiers(
        &self,
        outgoing: Option<Arc<dyn TcpModifier>>,
        incoming: Option<Arc<dyn TcpModifier>>,
    ) {
        let mut state = self.state.write().await;
        state.outgoing_modifier = outgoing;
        state.incoming_modifier = incoming;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Closes every live relay, then the front-end and both listeners.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let relays = self.registry.close_all();
        self.shutdown.cancel();
        info!("interceptor closed, {relays} live relays dropped");
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_socks(listener: TcpListener, shared: Arc<ProxyShared>, shutdown: CancellationToken) {
    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(target: "socks", "SOCKS5 front-end failed to accept: {e:?}");
                    continue;
                }
            },
        };

        if shared.settings.tcp_nodelay {
            let _ = socket.set_nodelay(true);
        }

        let shared = shared.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                r = serve_socks5(socket, addr, &shared) => r,
                _ = shutdown.cancelled() => Ok(()),
            };

            if let Err(e) = result {
                if shared.settings.socks_log {
                    error!(target: "socks", "Proxy error from {addr}: {e}");
                }
            }
        });
    }
}
