//! Interception proxy with a SOCKS5 front-end.
//!
//! Every TCP session accepted by the SOCKS5 server is sniffed and spliced into one of two
//! internal listeners (plain HTTP, or HTTPS with HTTP/2), where requests, responses and
//! WebSocket messages go through user hooks before being relayed to the real target.
//! UDP associations are relayed datagram by datagram through a UDP hook.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod state;
pub mod stream;

pub use config::Settings;
pub use error::{BoxError, InterceptError, ListenerKind};
pub use http::context::{RequestContext, RequestSnapshot, ResponseContext, Scheme};
pub use http::dispatch::DispatchOptions;
pub use http::headers::HeaderCollection;
pub use http::hooks::{
    request_hook, response_hook, websocket_hook, RequestAction, RequestHook, ResponseAction, ResponseHook,
    WebSocketHook,
};
pub use http::websocket::{Direction, Payload};
pub use proxy::registry::{RelayInfo, RelayKind, RelayRegistry, RelayState};
pub use proxy::relay::TcpModifier;
pub use proxy::udp::{udp_hook, UdpHook, UdpInterceptor, UdpPacket};
pub use proxy::{Interceptor, ProxyError};
pub use stream::chain::{ChainError, Sink, Source, StreamChain, Transform};
pub use stream::collect::{collect_fn, CollectFn, CollectTransform};
pub use stream::io::ByteSource;
