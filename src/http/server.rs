use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::http::context::Scheme;
use crate::http::liveness::TrackedIo;
use crate::http::{request, ConnectionInfo, HttpShared};
use crate::proxy::client_tls::ALPN_H2;

/// Accept loop of one internal listener. `acceptor` set means HTTPS (HTTP/2 over ALPN).
pub(crate) async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<HttpShared>,
    shutdown: CancellationToken,
) {
    let scheme = if acceptor.is_some() { Scheme::Https } else { Scheme::Http };

    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("{scheme} listener failed to accept: {e:?}");
                    continue;
                }
            },
        };

        if shared.settings.tcp_nodelay {
            let _ = socket.set_nodelay(true);
        }

        let acceptor = acceptor.clone();
        let shared = shared.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            // Connections coming through a relay are reported under the SOCKS client address.
            let peer_addr = shared.registry.client_for_loopback(addr).unwrap_or(addr);

            match acceptor {
                None => {
                    let (io, liveness) = TrackedIo::new(socket);
                    let conn = ConnectionInfo { scheme, peer_addr: Some(peer_addr), liveness };
                    if let Err(e) = serve_connection(io, false, conn, shared, shutdown).await {
                        debug!("HTTP connection from {peer_addr} ended: {e:?}");
                    }
                }
                Some(acceptor) => {
                    let timeout = shared.settings.request_timeout_std();
                    let tls_stream = match tokio::time::timeout(timeout, acceptor.accept(socket)).await {
                        Ok(Ok(tls_stream)) => tls_stream,
                        Ok(Err(e)) => {
                            error!("TLS handshake failed from {peer_addr}: {e:?}");
                            return;
                        }
                        Err(_) => {
                            error!("TLS handshake timed out from {peer_addr}");
                            return;
                        }
                    };

                    let h2 = tls_stream.get_ref().1.alpn_protocol() == Some(ALPN_H2);
                    let (io, liveness) = TrackedIo::new(tls_stream);
                    let conn = ConnectionInfo { scheme, peer_addr: Some(peer_addr), liveness };
                    if let Err(e) = serve_connection(io, h2, conn, shared, shutdown).await {
                        debug!("HTTPS connection from {peer_addr} ended: {e:?}");
                    }
                }
            }
        });
    }
}

async fn serve_connection<IO>(
    io: IO,
    h2: bool,
    conn: ConnectionInfo,
    shared: Arc<HttpShared>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn = Arc::new(conn);
    let service = service_fn(move |req| request::handle(req, shared.clone(), conn.clone()));
    let io = TokioIo::new(io);

    if h2 {
        let connection = http2::Builder::new(TokioExecutor::new()).serve_connection(io, service);
        tokio::select! {
            r = connection => r,
            _ = shutdown.cancelled() => Ok(()),
        }
    } else {
        let connection = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades();
        tokio::select! {
            r = connection => r,
            _ = shutdown.cancelled() => Ok(()),
        }
    }
}

/// Address a relay dials to reach a listener bound on `bound`.
pub(crate) fn loopback_addr(bound: SocketAddr) -> SocketAddr {
    let mut addr = bound;
    if addr.ip().is_unspecified() {
        addr.set_ip(match addr.ip() {
            std::net::IpAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
            std::net::IpAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
        });
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_addr() {
        let bound: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(loopback_addr(bound), "127.0.0.1:8080".parse().unwrap());

        let bound: SocketAddr = "[::]:8443".parse().unwrap();
        assert_eq!(loopback_addr(bound), "[::1]:8443".parse().unwrap());

        let bound: SocketAddr = "10.0.0.2:80".parse().unwrap();
        assert_eq!(loopback_addr(bound), bound);
    }
}
