use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::{Method, Response, StatusCode, Version};
use serde_json::{Map, Value};

use crate::error::InterceptError;
use crate::http::headers::HeaderCollection;
use crate::stream::io::{full_body, ProxyBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn websocket(&self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a `host[:port]` authority. Bracketed IPv6 literals lose their brackets.
pub(crate) fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (&rest[..end], port);
        }
    }

    match authority.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name, port.parse().ok()),
        _ => (authority, None),
    }
}

/// Host as it appears in a URL: IPv6 literals are bracketed.
pub(crate) fn url_host(hostname: &str) -> String {
    if hostname.contains(':') {
        format!("[{hostname}]")
    } else {
        hostname.to_owned()
    }
}

/// The mutable view of an inbound request handed to the request hook.
pub struct RequestContext {
    pub method: Method,
    pub scheme: Scheme,
    /// May carry a `:port` suffix, which wins over `port`.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Path and query.
    pub path: String,
    pub headers: HeaderCollection,
    /// Offer `h2` over ALPN on outbound TLS connections.
    pub auto_http2: bool,
    /// Merged over the computed dispatch options before connecting.
    pub passthrough: Map<String, Value>,

    client_version: Version,
    websocket: bool,
    peer_addr: Option<SocketAddr>,
    original_headers: HeaderCollection,
    response: Option<Response<ProxyBody>>,
}

impl RequestContext {
    pub fn new(method: Method, scheme: Scheme, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme,
            host: None,
            port: None,
            path: path.into(),
            headers: HeaderCollection::new(),
            auto_http2: true,
            passthrough: Map::new(),
            client_version: Version::HTTP_11,
            websocket: false,
            peer_addr: None,
            original_headers: HeaderCollection::new(),
            response: None,
        }
    }

    pub(crate) fn from_request_parts(
        parts: &Parts,
        scheme: Scheme,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let headers = HeaderCollection::from_header_map(&parts.headers);

        // `:authority` for HTTP/2 and absolute-form HTTP/1.1, otherwise the host header.
        let host = parts
            .uri
            .authority()
            .map(|authority| authority.as_str().to_owned())
            .or_else(|| headers.get("host").map(str::to_owned));

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        let websocket = headers
            .get("upgrade")
            .is_some_and(|u| u.trim().eq_ignore_ascii_case("websocket"));

        Self {
            method: parts.method.clone(),
            scheme,
            host,
            port: None,
            path,
            original_headers: headers.clone(),
            headers,
            auto_http2: true,
            passthrough: Map::new(),
            client_version: parts.version,
            websocket,
            peer_addr,
            response: None,
        }
    }

    pub fn client_version(&self) -> Version {
        self.client_version
    }

    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn original_headers(&self) -> &HeaderCollection {
        &self.original_headers
    }

    pub fn hostname(&self) -> Option<&str> {
        self.host
            .as_deref()
            .map(|host| split_authority(host).0)
            .filter(|name| !name.is_empty())
    }

    pub fn hostport(&self) -> u16 {
        self.host
            .as_deref()
            .and_then(|host| split_authority(host).1)
            .or(self.port)
            .unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn to_url(&self) -> Result<String, InterceptError> {
        let hostname = self.hostname().ok_or(InterceptError::MissingHost)?;
        Ok(format!(
            "{}://{}:{}{}",
            self.scheme,
            url_host(hostname),
            self.hostport(),
            self.path
        ))
    }

    /// Answer the client directly; nothing is dispatched once a response is set.
    pub fn respond(&mut self, status: StatusCode, body: impl Into<Bytes>) {
        let mut response = Response::new(full_body(body));
        *response.status_mut() = status;
        self.response = Some(response);
    }

    pub fn respond_with(&mut self, response: Response<ProxyBody>) {
        self.response = Some(response);
    }

    pub fn has_responded(&self) -> bool {
        self.response.is_some()
    }

    pub(crate) fn take_response(&mut self) -> Option<Response<ProxyBody>> {
        self.response.take()
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            method: self.method.clone(),
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            headers: self.headers.clone(),
            url: self.to_url().ok(),
            client_version: self.client_version,
            websocket: self.websocket,
            peer_addr: self.peer_addr,
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("client_version", &self.client_version)
            .field("websocket", &self.websocket)
            .field("responded", &self.response.is_some())
            .finish()
    }
}

/// The request as it was dispatched, after the request hook ran.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub scheme: Scheme,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub headers: HeaderCollection,
    pub url: Option<String>,
    pub client_version: Version,
    pub websocket: bool,
    pub peer_addr: Option<SocketAddr>,
}

/// The mutable view of an outbound response handed to the response hook.
#[derive(Debug)]
pub struct ResponseContext {
    pub status: StatusCode,
    pub headers: HeaderCollection,
    request: Arc<RequestSnapshot>,
    server_version: Version,
    original_headers: HeaderCollection,
}

impl ResponseContext {
    pub fn new(
        status: StatusCode,
        headers: HeaderCollection,
        request: Arc<RequestSnapshot>,
        server_version: Version,
    ) -> Self {
        Self {
            status,
            original_headers: headers.clone(),
            headers,
            request,
            server_version,
        }
    }

    pub fn request(&self) -> &RequestSnapshot {
        &self.request
    }

    pub fn server_version(&self) -> Version {
        self.server_version
    }

    pub fn original_headers(&self) -> &HeaderCollection {
        &self.original_headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(builder: http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_host_from_header_and_url() {
        let parts = parts(
            Request::get("/favicon.ico")
                .header("host", "localhost:8080")
                .header("etag", "\"v1\""),
        );
        let ctx = RequestContext::from_request_parts(&parts, Scheme::Http, None);

        assert_eq!(ctx.hostname(), Some("localhost"));
        assert_eq!(ctx.hostport(), 8080);
        assert_eq!(ctx.to_url().unwrap(), "http://localhost:8080/favicon.ico");
        assert!(!ctx.is_websocket());
    }

    #[test]
    fn test_authority_wins_over_host_header() {
        let parts = parts(
            Request::get("https://example.com/a?b=c")
                .version(Version::HTTP_2)
                .header("host", "ignored.test"),
        );
        let ctx = RequestContext::from_request_parts(&parts, Scheme::Https, None);

        assert_eq!(ctx.hostname(), Some("example.com"));
        assert_eq!(ctx.hostport(), 443);
        assert_eq!(ctx.path, "/a?b=c");
        assert_eq!(ctx.client_version(), Version::HTTP_2);
    }

    #[test]
    fn test_port_fallbacks() {
        let mut ctx = RequestContext::new(Method::GET, Scheme::Https, "/");
        assert!(matches!(ctx.to_url(), Err(InterceptError::MissingHost)));

        ctx.host = Some("[::1]".into());
        assert_eq!(ctx.hostname(), Some("::1"));
        assert_eq!(ctx.hostport(), 443);

        ctx.port = Some(8443);
        assert_eq!(ctx.to_url().unwrap(), "https://[::1]:8443/");

        ctx.host = Some("[::1]:9000".into());
        assert_eq!(ctx.hostport(), 9000);
    }

    #[test]
    fn test_websocket_detection_and_snapshot_isolation() {
        let parts = parts(
            Request::get("/chat")
                .header("host", "chat.test")
                .header("Upgrade", "WebSocket"),
        );
        let mut ctx = RequestContext::from_request_parts(&parts, Scheme::Http, None);
        assert!(ctx.is_websocket());

        ctx.headers.remove("upgrade");
        let snapshot = ctx.snapshot();
        ctx.path = "/changed".into();

        assert!(snapshot.websocket);
        assert_eq!(snapshot.path, "/chat");
        assert!(!snapshot.headers.contains("upgrade"));
        assert!(ctx.original_headers().contains("upgrade"));
        assert_eq!(snapshot.url.as_deref(), Some("http://chat.test:80/chat"));
    }

    #[test]
    fn test_terminal_response() {
        let mut ctx = RequestContext::new(Method::GET, Scheme::Http, "/");
        assert!(!ctx.has_responded());
        ctx.respond(StatusCode::FORBIDDEN, "nope");
        assert!(ctx.has_responded());
        assert_eq!(ctx.take_response().unwrap().status(), StatusCode::FORBIDDEN);
    }
}
