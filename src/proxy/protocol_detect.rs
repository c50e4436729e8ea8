use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{InterceptError, ListenerKind};
use crate::http::server::loopback_addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedProtocol {
    Http,
    /// TLS or anything else that is not plain HTTP.
    Https,
}

impl DetectedProtocol {
    pub fn listener(self) -> ListenerKind {
        match self {
            DetectedProtocol::Http => ListenerKind::Http,
            DetectedProtocol::Https => ListenerKind::Https,
        }
    }
}

const METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"CONNECT ",
    b"OPTIONS ",
    b"TRACE ",
    b"PATCH ",
];

pub const SNIFF_LEN: usize = 15;

const RETRY_DELAY: Duration = Duration::from_millis(5);

/// `None` while `buf` is still a strict prefix of some method token.
pub fn classify(buf: &[u8]) -> Option<DetectedProtocol> {
    if METHODS.iter().any(|method| buf.starts_with(method)) {
        return Some(DetectedProtocol::Http);
    }

    if METHODS.iter().any(|method| method.starts_with(buf)) {
        return None;
    }

    Some(DetectedProtocol::Https)
}

pub fn is_tls_record(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == 0x16 && buf[1] == 0x03
}

/// Peek at the first bytes of a tunnel without consuming them.
///
/// An inconclusive prefix that never grows within `timeout` is treated as opaque.
pub async fn sniff(stream: &TcpStream, timeout: Duration) -> io::Result<DetectedProtocol> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; SNIFF_LEN];

    loop {
        let n = tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await;
        let n = match n {
            Ok(n) => n?,
            Err(_) => return Ok(DetectedProtocol::Https),
        };

        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed before sending anything"));
        }

        let seen = &buf[..n];
        if is_tls_record(seen) {
            trace!("TLS record header seen on tunnel");
        }

        match classify(seen) {
            Some(proto) => return Ok(proto),
            None if n == SNIFF_LEN => return Ok(DetectedProtocol::Https),
            None if Instant::now() >= deadline => return Ok(DetectedProtocol::Https),
            None => tokio::time::sleep(RETRY_DELAY).await,
        }
    }
}

/// Loopback address of the internal listener serving `proto`.
pub fn resolve_listener(
    proto: DetectedProtocol,
    http: Option<SocketAddr>,
    https: Option<SocketAddr>,
) -> Result<SocketAddr, InterceptError> {
    let bound = match proto {
        DetectedProtocol::Http => http,
        DetectedProtocol::Https => https,
    };

    bound
        .map(loopback_addr)
        .ok_or(InterceptError::ListenerNotReady(proto.listener()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_classify() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\n"), Some(DetectedProtocol::Http));
        assert_eq!(classify(b"OPTIONS * HTTP/1.1"), Some(DetectedProtocol::Http));
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x02, 0x00]), Some(DetectedProtocol::Https));
        assert_eq!(classify(b"GETX"), Some(DetectedProtocol::Https));
        assert_eq!(classify(b"get / HTTP/1.1"), Some(DetectedProtocol::Https));

        assert_eq!(classify(b"G"), None);
        assert_eq!(classify(b"DELE"), None);
        assert_eq!(classify(b"GET"), None);
    }

    #[test]
    fn test_resolve_listener() {
        let http: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(
            resolve_listener(DetectedProtocol::Http, Some(http), None).unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            resolve_listener(DetectedProtocol::Https, Some(http), None),
            Err(InterceptError::ListenerNotReady(ListenerKind::Https))
        ));
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_sniff_leaves_bytes_in_place() {
        let (mut client, mut server) = pair().await;
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let proto = sniff(&server, Duration::from_secs(1)).await.unwrap();
        assert_eq!(proto, DetectedProtocol::Http);

        let mut buf = [0u8; 18];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_sniff_waits_for_split_method() {
        let (mut client, server) = pair().await;
        client.write_all(b"PO").await.unwrap();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.write_all(b"ST /form HTTP/1.1\r\n").await.unwrap();
            client
        });

        let proto = sniff(&server, Duration::from_secs(2)).await.unwrap();
        assert_eq!(proto, DetectedProtocol::Http);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_sniff_tls_and_closed_peer() {
        let (mut client, server) = pair().await;
        client.write_all(&[0x16, 0x03, 0x01, 0x00, 0xa5, 0x01]).await.unwrap();
        assert_eq!(sniff(&server, Duration::from_secs(1)).await.unwrap(), DetectedProtocol::Https);

        let (client, server) = pair().await;
        drop(client);
        let err = sniff(&server, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_stalled_prefix_times_out_as_opaque() {
        let (mut client, server) = pair().await;
        client.write_all(b"HEA").await.unwrap();
        let proto = sniff(&server, Duration::from_millis(100)).await.unwrap();
        assert_eq!(proto, DetectedProtocol::Https);
        drop(client);
    }
}
