use std::sync::Arc;

use http::header::SEC_WEBSOCKET_KEY;
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use tracing::{debug, info, warn};

use crate::error::InterceptError;
use crate::http::context::RequestContext;
use crate::http::dispatch::{self, DispatchOptions};
use crate::http::hooks::RequestAction;
use crate::http::{response, websocket, ConnectionInfo, HttpShared};
use crate::stream::chain::{ChainBuilder, StreamChain};
use crate::stream::collect::CollectTransform;
use crate::stream::io::{empty_body, BodySource, ChannelSink, ProxyBody};

/// Abort unless the inbound connection is still there, tearing down what was built.
fn ensure_alive(conn: &ConnectionInfo, stages: &mut Option<ChainBuilder>) -> Result<(), InterceptError> {
    if conn.liveness.is_closed() {
        if let Some(stages) = stages.take() {
            stages.destroy();
        }
        return Err(InterceptError::InboundClosed);
    }
    Ok(())
}

fn abort(stages: &mut Option<ChainBuilder>, err: InterceptError) -> InterceptError {
    if let Some(stages) = stages.take() {
        stages.destroy();
    }
    err
}

/// Single entry point of both internal listeners.
pub(crate) async fn handle(
    req: Request<Incoming>,
    shared: Arc<HttpShared>,
    conn: Arc<ConnectionInfo>,
) -> Result<Response<ProxyBody>, InterceptError> {
    let result = intercept(req, &shared, &conn).await;

    if let Err(ref err) = result {
        if shared.settings.http_log {
            warn!(target: "http", "request from {:?} aborted: {err}", conn.peer_addr);
        }
    }

    result
}

async fn intercept(
    mut req: Request<Incoming>,
    shared: &HttpShared,
    conn: &ConnectionInfo,
) -> Result<Response<ProxyBody>, InterceptError> {
    let websocket_upgrade = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|u| u.to_str().ok())
        .is_some_and(|u| u.trim().eq_ignore_ascii_case("websocket"));
    let on_upgrade = websocket_upgrade.then(|| hyper::upgrade::on(&mut req));

    let (parts, body) = req.into_parts();
    let inbound_empty = body.is_end_stream();
    let mut ctx = RequestContext::from_request_parts(&parts, conn.scheme, conn.peer_addr);
    let raw_url = ctx.to_url().ok();

    let mut stages = Some(StreamChain::builder(BodySource::new(body, "inbound-request")));
    let mut rewritten = false;

    ensure_alive(conn, &mut stages)?;

    let (request_hook, response_hook) = {
        let state = shared.state.read().await;
        (state.request_hook.clone(), state.response_hook.clone())
    };

    if let Some(hook) = request_hook {
        let action = hook.on_request(&mut ctx).await;
        ensure_alive(conn, &mut stages)?;

        if let Some(terminal) = ctx.take_response() {
            if let Some(stages) = stages.take() {
                stages.destroy();
            }
            return Ok(terminal);
        }

        let action = action.map_err(|err| abort(&mut stages, InterceptError::HookFailed(err)))?;
        match action {
            RequestAction::Pass => {}
            RequestAction::Block => return Err(abort(&mut stages, InterceptError::HookBlocked)),
            RequestAction::Replace(_) | RequestAction::Collect(_) if ctx.is_websocket() => {
                warn!(target: "http", "body rewrite ignored for websocket upgrade of {}", ctx.path);
            }
            RequestAction::Replace(source) => {
                if let Some(stages) = stages.as_mut() {
                    stages.replace_source(Box::new(source));
                }
                ctx.headers.remove("content-length");
                rewritten = true;
            }
            RequestAction::Collect(handler) => {
                if let Some(stages) = stages.as_mut() {
                    stages.push(CollectTransform::new(handler));
                }
                ctx.headers.remove("content-length");
                rewritten = true;
            }
        }
    }

    let options = DispatchOptions::from_context(&ctx).map_err(|err| abort(&mut stages, err))?;
    let snapshot = Arc::new(ctx.snapshot());

    if shared.settings.http_log {
        info!(
            target: "http",
            "{} {} -> {}",
            options.method,
            raw_url.as_deref().unwrap_or("-"),
            options.url(ctx.scheme)
        );
    }

    if let Some(on_upgrade) = on_upgrade {
        if let Some(stages) = stages.take() {
            stages.destroy();
        }
        let client_key = ctx.original_headers().get_all(SEC_WEBSOCKET_KEY.as_str()).next().cloned();
        return websocket::bridge(&options, ctx.scheme, client_key, on_upgrade, snapshot, shared).await;
    }

    let mut outbound = dispatch::connect(&options, ctx.scheme, ctx.auto_http2, shared)
        .await
        .map_err(|err| abort(&mut stages, err))?;

    let body = match stages.take() {
        Some(stages) if inbound_empty && !rewritten => {
            stages.destroy();
            empty_body()
        }
        Some(stages) => {
            let (sink, body) = ChannelSink::channel("outbound-request");
            let chain = stages.sink(sink);
            tokio::spawn(async move {
                if let Err(err) = chain.run().await {
                    debug!(target: "http", "request body chain failed: {err}");
                }
            });
            body
        }
        None => empty_body(),
    };

    let outbound_req = dispatch::build_request(&options, ctx.scheme, outbound.version(), body)?;
    let timeout = options.timeout(shared.settings.request_timeout_std());
    let upstream = tokio::time::timeout(timeout, outbound.send(outbound_req)).await??;

    response::intercept(upstream, snapshot, response_hook, &conn.liveness, shared.settings.http_log).await
}
