use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_ENCODING, TRANSFER_ENCODING};
use http::{Response, Version};
use hyper::body::Body;
use tracing::debug;

use crate::error::{BoxError, InterceptError};
use crate::http::context::{RequestSnapshot, ResponseContext};
use crate::http::dispatch::CONNECTION_HEADERS;
use crate::http::headers::HeaderCollection;
use crate::http::hooks::{ResponseAction, ResponseHook};
use crate::http::liveness::Liveness;
use crate::stream::chain::StreamChain;
use crate::stream::codec::ContentCoding;
use crate::stream::collect::CollectTransform;
use crate::stream::io::{empty_body, BodySource, ChannelSink, ProxyBody};

fn is_http2(version: Version) -> bool {
    version == Version::HTTP_2
}

/// Final header shaping once the body plan is known.
///
/// `rewritten` bodies have no known length; HTTP/1.x clients get them chunked.
pub(crate) fn finalize_headers(
    headers: &mut HeaderCollection,
    client_version: Version,
    server_version: Version,
    rewritten: bool,
) {
    if rewritten {
        headers.remove("content-length");
    }

    if is_http2(client_version) || is_http2(server_version) {
        headers.remove("host");
        headers.remove("transfer-encoding");
    }

    if is_http2(client_version) {
        for name in CONNECTION_HEADERS {
            headers.remove(name);
        }
    } else if rewritten {
        headers.insert_value(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
}

/// The decoder a Collect needs in front of it, if any. The encoding header goes away with it.
fn take_decoder(headers: &mut HeaderCollection) -> Result<Option<ContentCoding>, InterceptError> {
    let coding = match headers.get(CONTENT_ENCODING.as_str()) {
        Some(token) => ContentCoding::parse(token)?,
        None => None,
    };
    headers.remove(CONTENT_ENCODING.as_str());
    Ok(coding)
}

/// Runs the response hook over an outbound response and assembles what the client receives.
pub(crate) async fn intercept<B>(
    response: Response<B>,
    snapshot: Arc<RequestSnapshot>,
    hook: Option<Arc<dyn ResponseHook>>,
    liveness: &Liveness,
    http_log: bool,
) -> Result<Response<ProxyBody>, InterceptError>
where
    B: Body<Data = bytes::Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    if liveness.is_closed() {
        return Err(InterceptError::InboundClosed);
    }

    let client_version = snapshot.client_version;
    let (parts, body) = response.into_parts();
    let upstream_empty = body.is_end_stream();

    let mut ctx = ResponseContext::new(
        parts.status,
        HeaderCollection::from_header_map(&parts.headers),
        snapshot,
        parts.version,
    );
    let mut stages = StreamChain::builder(BodySource::new(body, "outbound-response"));
    let mut rewritten = false;

    if let Some(hook) = hook {
        let action = match hook.on_response(&mut ctx).await {
            Ok(action) => action,
            Err(err) => {
                stages.destroy();
                return Err(InterceptError::HookFailed(err));
            }
        };

        // The client may have gone away while the hook ran.
        if liveness.is_closed() {
            stages.destroy();
            return Err(InterceptError::InboundClosed);
        }

        match action {
            ResponseAction::Pass => {}
            ResponseAction::Collect(handler) => {
                let coding = match take_decoder(&mut ctx.headers) {
                    Ok(coding) => coding,
                    Err(err) => {
                        stages.destroy();
                        return Err(err);
                    }
                };
                if let Some(coding) = coding {
                    stages.push(coding.decoder());
                }
                stages.push(CollectTransform::new(handler));
                rewritten = true;
            }
            ResponseAction::Replace(source) => {
                stages.replace_source(Box::new(source));
                ctx.headers.remove(CONTENT_ENCODING.as_str());
                rewritten = true;
            }
        }
    }

    let server_version = ctx.server_version();
    finalize_headers(&mut ctx.headers, client_version, server_version, rewritten);

    if http_log {
        debug!(
            target: "http",
            "{} {} <- {:?}",
            ctx.status,
            ctx.request().url.as_deref().unwrap_or("-"),
            server_version
        );
    }

    let body = if upstream_empty && !rewritten {
        stages.destroy();
        empty_body()
    } else {
        let (sink, body) = ChannelSink::channel("inbound-response");
        let chain = stages.sink(sink);
        tokio::spawn(async move {
            if let Err(err) = chain.run().await {
                debug!(target: "http", "response body chain failed: {err}");
            }
        });
        body
    };

    let mut inbound = Response::new(body);
    *inbound.status_mut() = ctx.status;
    *inbound.headers_mut() = ctx.headers.to_header_map();
    Ok(inbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures_util::FutureExt;
    use http::{Method, StatusCode};
    use http_body_util::BodyExt;

    use crate::http::context::{RequestContext, Scheme};
    use crate::http::hooks::response_hook;
    use crate::stream::io::full_body;

    fn snapshot() -> Arc<RequestSnapshot> {
        Arc::new(RequestContext::new(Method::GET, Scheme::Http, "/").snapshot())
    }

    fn upstream(body: &'static str) -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-length", body.len())
            .body(full_body(body))
            .unwrap()
    }

    fn upstream_headers() -> HeaderCollection {
        let mut headers = HeaderCollection::new();
        headers.insert("content-type", "text/html").unwrap();
        headers.insert("content-length", "120").unwrap();
        headers.insert("content-encoding", "gzip").unwrap();
        headers.insert("connection", "keep-alive").unwrap();
        headers
    }

    #[test]
    fn test_collect_headers_for_http1_client() {
        let mut headers = upstream_headers();
        assert_eq!(take_decoder(&mut headers).unwrap(), Some(ContentCoding::Gzip));
        finalize_headers(&mut headers, Version::HTTP_11, Version::HTTP_11, true);

        assert!(!headers.contains("content-length"));
        assert!(!headers.contains("content-encoding"));
        assert_eq!(headers.get("transfer-encoding"), Some("chunked"));
        assert_eq!(headers.get("connection"), Some("keep-alive"));
    }

    #[test]
    fn test_http2_client_gets_no_connection_headers() {
        let mut headers = upstream_headers();
        headers.insert("transfer-encoding", "chunked").unwrap();
        finalize_headers(&mut headers, Version::HTTP_2, Version::HTTP_11, true);

        assert!(!headers.contains("transfer-encoding"));
        assert!(!headers.contains("connection"));
        assert!(!headers.contains("content-length"));
        assert_eq!(headers.get("content-encoding"), Some("gzip"));
    }

    #[test]
    fn test_http2_origin_to_http1_client_pass() {
        let mut headers = upstream_headers();
        headers.insert("host", "example.com").unwrap();
        finalize_headers(&mut headers, Version::HTTP_11, Version::HTTP_2, false);

        assert!(!headers.contains("host"));
        assert_eq!(headers.get("content-length"), Some("120"));
        assert!(!headers.contains("transfer-encoding"));
    }

    #[test]
    fn test_unknown_encoding_aborts_collect() {
        let mut headers = HeaderCollection::new();
        headers.insert("content-encoding", "compress").unwrap();
        assert!(matches!(
            take_decoder(&mut headers),
            Err(InterceptError::UnsupportedEncoding(_))
        ));
    }

    #[tokio::test]
    async fn test_client_gone_during_hook_aborts() {
        let liveness = Liveness::new();
        let marker = liveness.clone();
        let hook_ran = Arc::new(AtomicBool::new(false));
        let seen = hook_ran.clone();

        let hook = response_hook(move |_ctx| {
            marker.mark_closed();
            seen.store(true, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(ResponseAction::Pass) }.boxed()
        });

        let result = intercept(upstream("origin"), snapshot(), Some(hook), &liveness, false).await;
        assert!(hook_ran.load(Ordering::SeqCst));
        assert!(matches!(result, Err(InterceptError::InboundClosed)));
    }

    #[tokio::test]
    async fn test_replace_drops_length_and_chunks() {
        let liveness = Liveness::new();
        let hook = response_hook(|_ctx| async { Ok::<_, anyhow::Error>(ResponseAction::replace("replaced")) }.boxed());

        let response = intercept(upstream("origin"), snapshot(), Some(hook), &liveness, false)
            .await
            .unwrap();
        assert!(!response.headers().contains_key("content-length"));
        assert_eq!(response.headers()["transfer-encoding"], "chunked");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, bytes::Bytes::from_static(b"replaced"));
    }
}
