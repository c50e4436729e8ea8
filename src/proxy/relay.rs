use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use crate::error::InterceptError;
use crate::proxy::protocol_detect::{resolve_listener, sniff, DetectedProtocol};
use crate::proxy::registry::{RelayHandle, RelayKind};
use crate::proxy::{ProxyError, ProxyShared};
use crate::stream::chain::{StreamChain, Transform};
use crate::stream::io::{ReaderSource, WriterSink};

/// Builds a fresh byte transform for every relayed TCP stream.
pub trait TcpModifier: Send + Sync {
    fn create(&self) -> Box<dyn Transform>;
}

impl<F> TcpModifier for F
where
    F: Fn() -> Box<dyn Transform> + Send + Sync,
{
    fn create(&self) -> Box<dyn Transform> {
        self()
    }
}

/// Relay one SOCKS CONNECT tunnel into the internal listener matching its first bytes.
pub(crate) async fn run_tcp(
    stream: TcpStream,
    client: SocketAddr,
    target: String,
    shared: &ProxyShared,
) -> Result<(), ProxyError> {
    let mut handle = shared.registry.register(client, target, RelayKind::TcpHttps);
    let cancel = handle.token();

    let result = tokio::select! {
        r = splice(&mut handle, stream, shared) => r,
        _ = cancel.cancelled() => Ok(()),
    };

    if let Err(ref err) = result {
        handle.proxy_error(err);
    }
    result
}

async fn dial_loopback(listener: SocketAddr, handle: &mut RelayHandle) -> std::io::Result<TcpStream> {
    let socket = if listener.is_ipv4() {
        let socket = TcpSocket::new_v4()?;
        socket.bind((Ipv4Addr::LOCALHOST, 0).into())?;
        socket
    } else {
        let socket = TcpSocket::new_v6()?;
        socket.bind((Ipv6Addr::LOCALHOST, 0).into())?;
        socket
    };

    handle.set_loopback(socket.local_addr()?);
    socket.connect(listener).await
}

async fn splice(handle: &mut RelayHandle, mut stream: TcpStream, shared: &ProxyShared) -> Result<(), ProxyError> {
    let proto = sniff(&stream, shared.settings.request_timeout_std()).await?;
    if proto == DetectedProtocol::Http {
        handle.set_kind(RelayKind::TcpHttp);
    }

    // Dropping `stream` on error is what terminates the tunnel.
    let listener = resolve_listener(proto, shared.http_addr, shared.https_addr)?;
    let mut upstream = dial_loopback(listener, handle).await?;
    if shared.settings.tcp_nodelay {
        let _ = upstream.set_nodelay(true);
    }
    handle.connected();

    let (outgoing, incoming) = {
        let state = shared.state.read().await;
        (state.outgoing_modifier.clone(), state.incoming_modifier.clone())
    };

    if outgoing.is_none() && incoming.is_none() {
        let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        debug!(target: "socks", "relay #{} done: {sent} bytes out, {received} bytes in", handle.id());
        return Ok(());
    }

    let (client_read, client_write) = stream.into_split();
    let (listener_read, listener_write) = upstream.into_split();

    tokio::try_join!(
        pipe(client_read, listener_write, outgoing.map(|m| m.create())),
        pipe(listener_read, client_write, incoming.map(|m| m.create())),
    )?;

    Ok(())
}

/// One direction of a modified relay.
async fn pipe<R, W>(reader: R, writer: W, modifier: Option<Box<dyn Transform>>) -> Result<(), InterceptError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut chain = StreamChain::builder(ReaderSource::new(reader));
    if let Some(modifier) = modifier {
        chain = chain.transform_boxed(modifier);
    }

    chain.sink(WriterSink::new(writer)).run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Rot13;

    #[async_trait]
    impl Transform for Rot13 {
        async fn transform(&mut self, chunk: Bytes) -> Result<Option<Bytes>, BoxError> {
            let rotated: Vec<u8> = chunk
                .iter()
                .map(|b| match b {
                    b'a'..=b'z' => (b - b'a' + 13) % 26 + b'a',
                    b'A'..=b'Z' => (b - b'A' + 13) % 26 + b'A',
                    _ => *b,
                })
                .collect();
            Ok(Some(rotated.into()))
        }
    }

    #[test]
    fn test_closure_is_a_modifier() {
        let modifier: Box<dyn TcpModifier> = Box::new(|| Box::new(Rot13) as Box<dyn Transform>);
        let _ = modifier.create();
        let _ = modifier.create();
    }

    #[tokio::test]
    async fn test_pipe_applies_modifier() {
        let (mut client, reader) = tokio::io::duplex(64);
        let (writer, mut listener) = tokio::io::duplex(64);

        let relay = tokio::spawn(pipe(reader, writer, Some(Box::new(Rot13) as Box<dyn Transform>)));

        client.write_all(b"Hello, World").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut out = String::new();
        listener.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "Uryyb, Jbeyq");
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipe_without_modifier_is_transparent() {
        let (mut client, reader) = tokio::io::duplex(64);
        let (writer, mut listener) = tokio::io::duplex(64);

        let relay = tokio::spawn(pipe(reader, writer, None));
        client.write_all(&[0x16, 0x03, 0x01, 0xff]).await.unwrap();
        drop(client);

        let mut out = Vec::new();
        listener.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![0x16, 0x03, 0x01, 0xff]);
        relay.await.unwrap().unwrap();
    }
}
