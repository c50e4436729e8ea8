use std::io;
use std::pin::Pin;
use std::task::{self, Poll};
use std::time::Duration;

use http::{Method, Request, Response, Uri, Version};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::InterceptError;
use crate::http::context::{url_host, RequestContext, Scheme};
use crate::http::headers::HeaderCollection;
use crate::http::HttpShared;
use crate::proxy::client_tls::negotiated_h2;
use crate::stream::io::ProxyBody;

/// Headers that only make sense hop-by-hop and are refused by HTTP/2.
pub(crate) const CONNECTION_HEADERS: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
];

/// Where and how a request is sent.
///
/// Computed from the request context, then the hook's passthrough bag is merged over it:
/// objects are merged key by key, any other value replaces the computed one.
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOptions {
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub method: Method,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// SNI and certificate name, when it differs from `hostname`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

pub(crate) fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, overlay) => *slot = overlay,
    }
}

impl DispatchOptions {
    pub fn from_context(ctx: &RequestContext) -> Result<Self, InterceptError> {
        let hostname = ctx.hostname().ok_or(InterceptError::MissingHost)?;

        let computed = DispatchOptions {
            method: ctx.method.clone(),
            hostname: hostname.to_owned(),
            port: ctx.hostport(),
            path: ctx.path.clone(),
            headers: ctx.headers.to_json(),
            timeout_secs: None,
            server_name: None,
        };

        if ctx.passthrough.is_empty() {
            return Ok(computed);
        }

        let mut overlay = ctx.passthrough.clone();
        if let Some(Value::Object(headers)) = overlay.get_mut("headers") {
            *headers = std::mem::take(headers)
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect();
        }

        let mut merged = serde_json::to_value(&computed)?;
        deep_merge(&mut merged, Value::Object(overlay));

        let options: DispatchOptions = serde_json::from_value(merged)?;
        // Rejects pseudo-headers smuggled in through the bag.
        options.header_collection()?;
        Ok(options)
    }

    pub fn header_collection(&self) -> Result<HeaderCollection, InterceptError> {
        HeaderCollection::from_json(&self.headers)
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.hostname)
    }

    /// `host[:port]`, the port left out when it is the scheme default.
    pub fn authority(&self, scheme: Scheme) -> String {
        let host = url_host(&self.hostname);
        if self.port == scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    pub fn url(&self, scheme: Scheme) -> String {
        format!(
            "{scheme}://{}:{}{}",
            url_host(&self.hostname),
            self.port,
            self.path
        )
    }
}

#[pin_project(project = OutboundStreamProj)]
pub(crate) enum OutboundStream {
    Plain(#[pin] TcpStream),
    Tls(#[pin] tokio_rustls::client::TlsStream<TcpStream>),
}

macro_rules! forward_call {
    ($self:expr, $method:ident $(, $param:expr)*) => {
        match $self.project() {
            OutboundStreamProj::Plain(stream) => stream.$method($($param),*),
            OutboundStreamProj::Tls(stream) => stream.$method($($param),*),
        }
    };
}

impl AsyncRead for OutboundStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        forward_call!(self, poll_read, cx, buf)
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        forward_call!(self, poll_write, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        forward_call!(self, poll_flush, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        forward_call!(self, poll_shutdown, cx)
    }
}

pub(crate) enum Outbound {
    Http1(http1::SendRequest<ProxyBody>),
    Http2(http2::SendRequest<ProxyBody>),
}

impl Outbound {
    pub fn version(&self) -> Version {
        match self {
            Outbound::Http1(_) => Version::HTTP_11,
            Outbound::Http2(_) => Version::HTTP_2,
        }
    }

    pub async fn send(&mut self, req: Request<ProxyBody>) -> hyper::Result<Response<Incoming>> {
        match self {
            Outbound::Http1(sender) => sender.send_request(req).await,
            Outbound::Http2(sender) => sender.send_request(req).await,
        }
    }
}

/// Open the outbound connection, TLS and ALPN included, bounded by `timeout`.
pub(crate) async fn connect(
    options: &DispatchOptions,
    scheme: Scheme,
    auto_http2: bool,
    shared: &HttpShared,
) -> Result<Outbound, InterceptError> {
    let timeout = options.timeout(shared.settings.request_timeout_std());
    tokio::time::timeout(timeout, connect_inner(options, scheme, auto_http2, shared)).await?
}

async fn connect_inner(
    options: &DispatchOptions,
    scheme: Scheme,
    auto_http2: bool,
    shared: &HttpShared,
) -> Result<Outbound, InterceptError> {
    let stream = TcpStream::connect((options.hostname.as_str(), options.port)).await?;
    if shared.settings.tcp_nodelay {
        stream.set_nodelay(true)?;
    }

    let target = format!("{}:{}", options.hostname, options.port);

    match scheme {
        Scheme::Http => handshake_http1(OutboundStream::Plain(stream), target).await,
        Scheme::Https => {
            let tls = shared
                .upstream
                .connect(stream, options.server_name(), auto_http2)
                .await?;

            if negotiated_h2(&tls) {
                handshake_http2(OutboundStream::Tls(tls), target).await
            } else {
                handshake_http1(OutboundStream::Tls(tls), target).await
            }
        }
    }
}

async fn handshake_http1(stream: OutboundStream, target: String) -> Result<Outbound, InterceptError> {
    let (sender, connection) = http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("HTTP/1.x connection to {target} aborted with error: {err}");
        }
    });

    Ok(Outbound::Http1(sender))
}

async fn handshake_http2(stream: OutboundStream, target: String) -> Result<Outbound, InterceptError> {
    let (sender, connection) = http2::Builder::new(TokioExecutor::new())
        .handshake(TokioIo::new(stream))
        .await?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("HTTP/2 connection to {target} aborted with error: {err}");
        }
    });

    Ok(Outbound::Http2(sender))
}

/// Build the request for the negotiated outbound version.
///
/// HTTP/2 gets an absolute URI and no connection-specific headers (nor `host`, which is
/// carried by `:authority`). HTTP/1.1 gets an origin-form URI and a `host` header.
pub(crate) fn build_request(
    options: &DispatchOptions,
    scheme: Scheme,
    version: Version,
    body: ProxyBody,
) -> Result<Request<ProxyBody>, InterceptError> {
    let mut headers = options.header_collection()?;
    let authority = options.authority(scheme);

    let uri = if version == Version::HTTP_2 {
        for name in CONNECTION_HEADERS {
            if name == "te" && headers.get("te").is_some_and(|te| te.eq_ignore_ascii_case("trailers")) {
                continue;
            }
            headers.remove(name);
        }
        headers.remove("host");
        format!("{scheme}://{authority}{}", options.path)
    } else {
        if !headers.contains("host") {
            headers.insert("host", &authority)?;
        }
        options.path.clone()
    };

    let uri: Uri = uri
        .parse()
        .map_err(|_| InterceptError::InvalidTarget(uri.clone()))?;
    trace!("outbound {version:?} request to {uri}");

    let mut req = Request::new(body);
    *req.method_mut() = options.method.clone();
    *req.uri_mut() = uri;
    *req.version_mut() = version;
    *req.headers_mut() = headers.to_header_map();
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::io::empty_body;
    use serde_json::json;

    fn context() -> RequestContext {
        let mut ctx = RequestContext::new(Method::GET, Scheme::Https, "/search?q=1");
        ctx.host = Some("example.com".into());
        ctx.headers.insert("host", "example.com").unwrap();
        ctx.headers.insert("accept", "text/html").unwrap();
        ctx.headers.insert("connection", "keep-alive").unwrap();
        ctx
    }

    #[test]
    fn test_computed_options() {
        let options = DispatchOptions::from_context(&context()).unwrap();
        assert_eq!(options.method, Method::GET);
        assert_eq!(options.hostname, "example.com");
        assert_eq!(options.port, 443);
        assert_eq!(options.path, "/search?q=1");
        assert_eq!(options.url(Scheme::Https), "https://example.com:443/search?q=1");
    }

    #[test]
    fn test_passthrough_is_deep_merged() {
        let mut ctx = context();
        ctx.passthrough = json!({
            "port": 8443,
            "headers": { "Accept": "application/json", "x-extra": ["a", "b"] },
            "server_name": "origin.internal",
        })
        .as_object()
        .cloned()
        .unwrap();

        let options = DispatchOptions::from_context(&ctx).unwrap();
        assert_eq!(options.port, 8443);
        assert_eq!(options.server_name(), "origin.internal");
        assert_eq!(options.authority(Scheme::Https), "example.com:8443");

        let headers = options.header_collection().unwrap();
        assert_eq!(headers.get("accept"), Some("application/json"));
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.get_all("x-extra").count(), 2);
    }

    #[test]
    fn test_pseudo_header_in_passthrough_is_refused() {
        let mut ctx = context();
        ctx.passthrough = json!({ "headers": { ":authority": "evil.test" } })
            .as_object()
            .cloned()
            .unwrap();

        assert!(matches!(
            DispatchOptions::from_context(&ctx),
            Err(InterceptError::BadHeader(_))
        ));
    }

    #[test]
    fn test_invalid_method_in_passthrough() {
        let mut ctx = context();
        ctx.passthrough = json!({ "method": "NOT A METHOD" }).as_object().cloned().unwrap();

        assert!(matches!(
            DispatchOptions::from_context(&ctx),
            Err(InterceptError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_missing_host() {
        let ctx = RequestContext::new(Method::GET, Scheme::Http, "/");
        assert!(matches!(
            DispatchOptions::from_context(&ctx),
            Err(InterceptError::MissingHost)
        ));
    }

    #[test]
    fn test_http2_request_shape() {
        let options = DispatchOptions::from_context(&context()).unwrap();
        let req = build_request(&options, Scheme::Https, Version::HTTP_2, empty_body()).unwrap();

        assert_eq!(req.uri().to_string(), "https://example.com/search?q=1");
        assert!(req.headers().get("host").is_none());
        assert!(req.headers().get("connection").is_none());
        assert!(req.headers().keys().all(|name| !name.as_str().starts_with(':')));
    }

    #[test]
    fn test_http1_request_shape() {
        let mut ctx = context();
        ctx.headers.remove("host");
        ctx.scheme = Scheme::Http;
        ctx.port = Some(8080);
        ctx.host = Some("example.com".into());

        let options = DispatchOptions::from_context(&ctx).unwrap();
        let req = build_request(&options, Scheme::Http, Version::HTTP_11, empty_body()).unwrap();

        assert_eq!(req.uri().to_string(), "/search?q=1");
        assert_eq!(req.headers().get("host").unwrap(), "example.com:8080");
    }
}
