use std::net::SocketAddr;

use fast_socks5::{ReplyError, Socks5Command, server::Socks5ServerProtocol};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::proxy::{ProxyError, ProxyShared, relay, udp};

/// Runs one SOCKS5 session: negotiation, command, reply, then the matching relay.
pub(crate) async fn serve_socks5(
    socket: TcpStream,
    client: SocketAddr,
    shared: &ProxyShared,
) -> Result<(), ProxyError> {
    // The UDP relay socket is bound on the address the client reached us on.
    let local_ip = socket.local_addr()?.ip();

    let (proto, cmd, target_addr) = Socks5ServerProtocol::accept_no_auth(socket).await?.read_command().await?;

    match cmd {
        Socks5Command::TCPConnect => {
            let target = target_addr.to_string();
            let local = SocketAddr::new(local_ip, 0);
            let stream = proto.reply_success(local).await?;
            relay::run_tcp(stream, client, target, shared).await
        }

        Socks5Command::UDPAssociate => {
            let client_socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
            let relay_addr = client_socket.local_addr()?;
            let control = proto.reply_success(relay_addr).await?;
            udp::run_association(control, client_socket, target_addr, client, shared).await
        }

        _ => {
            debug!(target: "socks", "Unsupported SOCKS5 command received from {client}, terminating connection");
            proto.reply_error(&ReplyError::CommandNotSupported).await?;
            Err(ProxyError::SocksError(ReplyError::CommandNotSupported.into()))
        }
    }
}
