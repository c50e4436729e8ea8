use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use fast_socks5::util::target_addr::TargetAddr;
use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, trace};

use crate::proxy::registry::{RelayHandle, RelayId, RelayKind};
use crate::proxy::{ProxyError, ProxyShared};

const MAX_DATAGRAM: usize = 65536;

/// One relayed datagram. `address` is an IP literal or a domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub address: String,
    pub port: u16,
    pub data: Bytes,
}

/// Invoked for every datagram of every association. An error drops the datagram.
#[async_trait]
pub trait UdpHook: Send + Sync {
    async fn on_packet(&self, from_client: bool, packet: &mut UdpPacket) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> UdpHook for F
where
    F: for<'a> Fn(bool, &'a mut UdpPacket) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync,
{
    async fn on_packet(&self, from_client: bool, packet: &mut UdpPacket) -> anyhow::Result<()> {
        self(from_client, packet).await
    }
}

pub fn udp_hook<F>(f: F) -> Arc<dyn UdpHook>
where
    F: for<'a> Fn(bool, &'a mut UdpPacket) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Applies a hook with the directional rules: datagrams from the client may be redirected,
/// datagrams from a server only have their payload rewritten.
#[derive(Clone, Default)]
pub struct UdpInterceptor {
    hook: Option<Arc<dyn UdpHook>>,
}

impl UdpInterceptor {
    pub fn new(hook: Option<Arc<dyn UdpHook>>) -> Self {
        Self { hook }
    }

    pub async fn intercept(&self, from_client: bool, packet: UdpPacket) -> anyhow::Result<UdpPacket> {
        let Some(ref hook) = self.hook else {
            return Ok(packet);
        };

        let mut mutated = packet.clone();
        hook.on_packet(from_client, &mut mutated).await?;

        if !from_client {
            mutated.address = packet.address;
            mutated.port = packet.port;
        }
        Ok(mutated)
    }
}

enum Event {
    Cancelled,
    ControlClosed,
    FromClient(usize, SocketAddr),
    FromServer(usize, SocketAddr),
    FromServerV6(usize, SocketAddr),
    Forwarded(Result<anyhow::Result<()>, JoinError>),
}

/// Client address given in the UDP ASSOCIATE request, when it is usable as is.
fn requested_client(requested: &TargetAddr) -> Option<SocketAddr> {
    match requested {
        TargetAddr::Ip(addr) if !addr.ip().is_unspecified() && addr.port() != 0 => Some(*addr),
        _ => None,
    }
}

/// Outbound sockets of one association, one per address family.
struct Forward {
    v4: UdpSocket,
    v6: Option<UdpSocket>,
}

impl Forward {
    async fn bind(handle: &RelayHandle) -> std::io::Result<Self> {
        let v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let v6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => Some(socket),
            Err(err) => {
                debug!(target: "socks", "relay #{}: no IPv6 forwarding: {err}", handle.id());
                None
            }
        };
        Ok(Self { v4, v6 })
    }

    fn socket_for(&self, destination: SocketAddr) -> anyhow::Result<&UdpSocket> {
        match destination {
            SocketAddr::V4(_) => Ok(&self.v4),
            SocketAddr::V6(_) => self
                .v6
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no IPv6 socket to reach {destination}")),
        }
    }
}

async fn recv_v6(socket: Option<&UdpSocket>, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Relay datagrams for one association until the control connection goes away.
///
/// `client_socket` is already bound and was announced in the SOCKS reply. Each datagram is
/// handled by its own task, so a slow hook call only delays its own datagram.
pub(crate) async fn run_association(
    mut control: TcpStream,
    client_socket: UdpSocket,
    requested: TargetAddr,
    client: SocketAddr,
    shared: &ProxyShared,
) -> Result<(), ProxyError> {
    let mut handle = shared.registry.register(client, requested.to_string(), RelayKind::Udp);
    let cancel = handle.token();

    let client_socket = Arc::new(client_socket);
    let forward = Arc::new(Forward::bind(&handle).await?);
    handle.connected();

    let mut pinned = requested_client(&requested);
    let mut tasks = JoinSet::new();
    let mut control_buf = [0u8; 64];
    let mut client_buf = vec![0u8; MAX_DATAGRAM];
    let mut server_buf = vec![0u8; MAX_DATAGRAM];
    let mut server6_buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => Event::Cancelled,
            read = control.read(&mut control_buf) => match read {
                Ok(0) | Err(_) => Event::ControlClosed,
                // Anything on the control connection after the reply is ignored.
                Ok(_) => continue,
            },
            received = client_socket.recv_from(&mut client_buf) => {
                let (n, from) = received?;
                Event::FromClient(n, from)
            }
            received = forward.v4.recv_from(&mut server_buf) => {
                let (n, from) = received?;
                Event::FromServer(n, from)
            }
            received = recv_v6(forward.v6.as_ref(), &mut server6_buf) => {
                let (n, from) = received?;
                Event::FromServerV6(n, from)
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => Event::Forwarded(joined),
        };

        match event {
            Event::Cancelled | Event::ControlClosed => break,
            Event::FromClient(n, from) => {
                match pinned {
                    Some(pinned) if pinned != from => continue,
                    Some(_) => {}
                    None if from.ip().to_canonical() == client.ip().to_canonical() => pinned = Some(from),
                    None => continue,
                }
                let datagram = Bytes::copy_from_slice(&client_buf[..n]);
                let interceptor = interceptor(shared).await;
                tasks.spawn(forward_to_server(datagram, forward.clone(), interceptor, handle.id()));
            }
            Event::FromServer(n, from) | Event::FromServerV6(n, from) => {
                let Some(pinned) = pinned else {
                    continue;
                };
                let received = match event {
                    Event::FromServerV6(..) => &server6_buf[..n],
                    _ => &server_buf[..n],
                };
                let datagram = Bytes::copy_from_slice(received);
                let interceptor = interceptor(shared).await;
                tasks.spawn(forward_to_client(datagram, from, pinned, client_socket.clone(), interceptor));
            }
            Event::Forwarded(Ok(Ok(()))) => {}
            Event::Forwarded(Ok(Err(err))) => handle.proxy_error(&format_args!("{err:#}")),
            Event::Forwarded(Err(err)) => handle.proxy_error(&err),
        }
    }

    tasks.abort_all();
    Ok(())
}

async fn interceptor(shared: &ProxyShared) -> UdpInterceptor {
    UdpInterceptor::new(shared.state.read().await.udp_hook.clone())
}

async fn forward_to_server(
    datagram: Bytes,
    forward: Arc<Forward>,
    interceptor: UdpInterceptor,
    relay: RelayId,
) -> anyhow::Result<()> {
    let (frag, target, payload) = fast_socks5::parse_udp_request(&datagram).await?;

    if frag != 0 {
        trace!(target: "socks", "relay #{relay}: dropping fragmented datagram");
        return Ok(());
    }

    let (address, port) = target.into_string_and_port();
    let packet = UdpPacket {
        address,
        port,
        data: datagram.slice_ref(payload),
    };

    let packet = interceptor.intercept(true, packet).await.context("udp hook failed")?;

    let destination = lookup_host((packet.address.as_str(), packet.port))
        .await
        .with_context(|| format!("resolving {}", packet.address))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address for {}", packet.address))?;

    forward.socket_for(destination)?.send_to(&packet.data, destination).await?;
    Ok(())
}

async fn forward_to_client(
    datagram: Bytes,
    from: SocketAddr,
    client: SocketAddr,
    client_socket: Arc<UdpSocket>,
    interceptor: UdpInterceptor,
) -> anyhow::Result<()> {
    let packet = UdpPacket {
        address: from.ip().to_string(),
        port: from.port(),
        data: datagram,
    };

    let packet = interceptor.intercept(false, packet).await.context("udp hook failed")?;

    let mut reply = fast_socks5::new_udp_header(from)?;
    reply.extend_from_slice(&packet.data);

    client_socket.send_to(&reply, client).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn packet() -> UdpPacket {
        UdpPacket {
            address: "10.0.0.1".into(),
            port: 53,
            data: Bytes::from_static(b"query"),
        }
    }

    fn rewriting_hook() -> Arc<dyn UdpHook> {
        udp_hook(|_from_client, packet| {
            async move {
                packet.address = "192.0.2.7".into();
                packet.port = 5353;
                packet.data = Bytes::from_static(b"rewritten");
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_no_hook_passes_through() {
        let out = UdpInterceptor::default().intercept(true, packet()).await.unwrap();
        assert_eq!(out, packet());
    }

    #[tokio::test]
    async fn test_client_datagram_can_be_redirected() {
        let out = UdpInterceptor::new(Some(rewriting_hook())).intercept(true, packet()).await.unwrap();
        assert_eq!(out.address, "192.0.2.7");
        assert_eq!(out.port, 5353);
        assert_eq!(out.data, Bytes::from_static(b"rewritten"));
    }

    #[tokio::test]
    async fn test_server_datagram_keeps_its_source() {
        let out = UdpInterceptor::new(Some(rewriting_hook())).intercept(false, packet()).await.unwrap();
        assert_eq!(out.address, "10.0.0.1");
        assert_eq!(out.port, 53);
        assert_eq!(out.data, Bytes::from_static(b"rewritten"));
    }

    #[tokio::test]
    async fn test_hook_error_is_reported() {
        let hook = udp_hook(|_, _| async { Err(anyhow::anyhow!("nope")) }.boxed());
        assert!(UdpInterceptor::new(Some(hook)).intercept(true, packet()).await.is_err());
    }

    #[test]
    fn test_requested_client() {
        let addr: SocketAddr = "192.168.1.10:40000".parse().unwrap();
        assert_eq!(requested_client(&TargetAddr::Ip(addr)), Some(addr));
        assert_eq!(requested_client(&TargetAddr::Ip("0.0.0.0:0".parse().unwrap())), None);
        assert_eq!(requested_client(&TargetAddr::Ip("192.168.1.10:0".parse().unwrap())), None);
        assert_eq!(requested_client(&TargetAddr::Domain("localhost".into(), 1)), None);
    }

    #[tokio::test]
    async fn test_forward_socket_follows_address_family() {
        let v4 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let v4_addr = v4.local_addr().unwrap();
        let mut forward = Forward { v4, v6: None };

        let to_v4: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let to_v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(forward.socket_for(to_v4).unwrap().local_addr().unwrap(), v4_addr);
        assert!(forward.socket_for(to_v6).is_err());

        // Hosts without IPv6 cannot bind the second socket; nothing left to check there.
        let Ok(v6) = UdpSocket::bind("[::1]:0").await else {
            return;
        };
        let v6_addr = v6.local_addr().unwrap();
        forward.v6 = Some(v6);
        assert_eq!(forward.socket_for(to_v6).unwrap().local_addr().unwrap(), v6_addr);
    }
}
