use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, WebSocketStream};
use tracing::{debug, warn};

use crate::error::InterceptError;
use crate::http::context::{RequestSnapshot, Scheme};
use crate::http::dispatch::DispatchOptions;
use crate::http::headers::HeaderCollection;
use crate::http::hooks::WebSocketHook;
use crate::http::HttpShared;
use crate::stream::io::{empty_body, ProxyBody};

/// Which peer sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    fn into_message(self) -> Message {
        match self {
            Payload::Text(text) => Message::text(text),
            Payload::Binary(data) => Message::binary(data),
        }
    }
}

/// Handshake headers renegotiated by the outbound client instead of forwarded.
const HANDSHAKE_HEADERS: [&str; 8] = [
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
    "transfer-encoding",
];

/// Open the upstream WebSocket, answer the client with `101 Switching Protocols` and relay
/// messages once the client side upgrade completes.
pub(crate) async fn bridge(
    options: &DispatchOptions,
    scheme: Scheme,
    client_key: Option<HeaderValue>,
    on_upgrade: OnUpgrade,
    snapshot: Arc<RequestSnapshot>,
    shared: &HttpShared,
) -> Result<Response<ProxyBody>, InterceptError> {
    let client_key = client_key
        .ok_or_else(|| InterceptError::BadHeader("missing sec-websocket-key".to_owned()))?;

    let url = format!(
        "{}://{}{}",
        scheme.websocket(),
        options.authority(scheme),
        options.path
    );
    let mut request = url.as_str().into_client_request()?;

    let headers: HeaderCollection = options.header_collection()?;
    for (name, value) in headers.iter() {
        if HANDSHAKE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }

    let connector = match scheme {
        Scheme::Https => Some(Connector::Rustls(shared.upstream.config(false))),
        Scheme::Http => Some(Connector::Plain),
    };

    let timeout = options.timeout(shared.settings.request_timeout_std());
    let (upstream, upstream_response) = tokio::time::timeout(
        timeout,
        tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            shared.settings.tcp_nodelay,
            connector,
        ),
    )
    .await??;

    let hook = shared.state.read().await.websocket_hook.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                debug!(target: "http", "websocket upgrade of {url} failed: {err}");
                return;
            }
        };

        let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        if let Err(err) = relay(client, upstream, snapshot, hook).await {
            debug!(target: "http", "websocket relay for {url} ended: {err}");
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&derive_accept_key(client_key.as_bytes()))
            .map_err(|_| InterceptError::BadHeader("sec-websocket-accept".to_owned()))?,
    );
    if let Some(protocol) = upstream_response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }

    Ok(response)
}

/// Both directions share one lifetime: whichever ends first closes the other.
async fn relay<C, U>(
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    snapshot: Arc<RequestSnapshot>,
    hook: Option<Arc<dyn WebSocketHook>>,
) -> Result<(), WsError>
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let hook = hook.as_deref();

    let result = tokio::select! {
        r = relay_messages(&mut client_rx, &mut upstream_tx, Direction::Client, &snapshot, hook) => r,
        r = relay_messages(&mut upstream_rx, &mut client_tx, Direction::Server, &snapshot, hook) => r,
    };

    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;
    result
}

async fn relay_messages<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    snapshot: &RequestSnapshot,
    hook: Option<&dyn WebSocketHook>,
) -> Result<(), WsError>
where
    R: StreamExt<Item = Result<Message, WsError>> + Unpin,
    W: SinkExt<Message, Error = WsError> + Unpin,
{
    while let Some(message) = reader.next().await {
        let payload = match message? {
            Message::Text(text) => Payload::Text(text.as_str().to_owned()),
            Message::Binary(data) => Payload::Binary(data),
            Message::Close(frame) => {
                writer.send(Message::Close(frame)).await?;
                return Ok(());
            }
            // Answered by tungstenite for each side separately.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let payload = match hook {
            None => payload,
            Some(hook) => match hook.on_message(snapshot, direction, &payload).await {
                Ok(Some(replacement)) => replacement,
                Ok(None) => payload,
                Err(err) => {
                    warn!(target: "http", "websocket hook failed, dropping {direction:?} message: {err:#}");
                    continue;
                }
            },
        };

        writer.send(payload.into_message()).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::context::RequestContext;
    use crate::http::hooks::websocket_hook;
    use futures_util::FutureExt;
    use http::Method;

    #[tokio::test]
    async fn test_relay_applies_hook_per_direction() {
        let (client_io, client_peer) = tokio::io::duplex(4096);
        let (upstream_io, upstream_peer) = tokio::io::duplex(4096);

        let client = WebSocketStream::from_raw_socket(client_io, Role::Server, None).await;
        let upstream = WebSocketStream::from_raw_socket(upstream_io, Role::Client, None).await;
        let mut browser = WebSocketStream::from_raw_socket(client_peer, Role::Client, None).await;
        let mut origin = WebSocketStream::from_raw_socket(upstream_peer, Role::Server, None).await;

        let hook = websocket_hook(|_request, direction, payload| {
            async move {
                Ok::<_, anyhow::Error>(match (direction, payload) {
                    (Direction::Client, Payload::Text(text)) => Some(Payload::Text(text.to_uppercase())),
                    _ => None,
                })
            }
            .boxed()
        });

        let snapshot = Arc::new(RequestContext::new(Method::GET, Scheme::Http, "/ws").snapshot());
        let bridge = tokio::spawn(relay(client, upstream, snapshot, Some(hook)));

        browser.send(Message::text("hello")).await.unwrap();
        browser.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();

        assert_eq!(origin.next().await.unwrap().unwrap(), Message::text("HELLO"));
        assert_eq!(origin.next().await.unwrap().unwrap(), Message::binary(vec![1u8, 2, 3]));

        origin.send(Message::text("from origin")).await.unwrap();
        assert_eq!(browser.next().await.unwrap().unwrap(), Message::text("from origin"));

        browser.close(None).await.unwrap();
        bridge.await.unwrap().unwrap();
    }
}
