use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::http::context::{RequestContext, RequestSnapshot, ResponseContext};
use crate::http::websocket::{Direction, Payload};
use crate::stream::collect::{collect_fn, CollectFn};
use crate::stream::io::ByteSource;

/// What to do with a request once the request hook has looked at it.
pub enum RequestAction {
    Pass,
    /// Abort. A response written through the context is still sent.
    Block,
    /// Drop the inbound body and send this one instead.
    Replace(ByteSource),
    /// Buffer the inbound body and send whatever the function makes of it.
    Collect(CollectFn),
}

impl RequestAction {
    pub fn replace(body: impl Into<ByteSource>) -> Self {
        RequestAction::Replace(body.into())
    }

    pub fn collect<F, Fut, T>(f: F) -> Self
    where
        F: FnOnce(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Into<Bytes>,
    {
        RequestAction::Collect(collect_fn(f))
    }
}

impl fmt::Debug for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestAction::Pass => f.write_str("Pass"),
            RequestAction::Block => f.write_str("Block"),
            RequestAction::Replace(source) => f.debug_tuple("Replace").field(source).finish(),
            RequestAction::Collect(_) => f.write_str("Collect(..)"),
        }
    }
}

pub enum ResponseAction {
    Pass,
    Replace(ByteSource),
    /// Receives the decoded body: gzip, deflate and br are undone first.
    Collect(CollectFn),
}

impl ResponseAction {
    pub fn replace(body: impl Into<ByteSource>) -> Self {
        ResponseAction::Replace(body.into())
    }

    pub fn collect<F, Fut, T>(f: F) -> Self
    where
        F: FnOnce(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Into<Bytes>,
    {
        ResponseAction::Collect(collect_fn(f))
    }
}

impl fmt::Debug for ResponseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseAction::Pass => f.write_str("Pass"),
            ResponseAction::Replace(source) => f.debug_tuple("Replace").field(source).finish(),
            ResponseAction::Collect(_) => f.write_str("Collect(..)"),
        }
    }
}

#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn on_request(&self, ctx: &mut RequestContext) -> anyhow::Result<RequestAction>;
}

#[async_trait]
impl<F> RequestHook for F
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, anyhow::Result<RequestAction>>
        + Send
        + Sync,
{
    async fn on_request(&self, ctx: &mut RequestContext) -> anyhow::Result<RequestAction> {
        self(ctx).await
    }
}

#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn on_response(&self, ctx: &mut ResponseContext) -> anyhow::Result<ResponseAction>;
}

#[async_trait]
impl<F> ResponseHook for F
where
    F: for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, anyhow::Result<ResponseAction>>
        + Send
        + Sync,
{
    async fn on_response(&self, ctx: &mut ResponseContext) -> anyhow::Result<ResponseAction> {
        self(ctx).await
    }
}

/// `Ok(Some(_))` replaces the message, `Ok(None)` forwards it untouched, an error drops it.
#[async_trait]
pub trait WebSocketHook: Send + Sync {
    async fn on_message(
        &self,
        request: &RequestSnapshot,
        direction: Direction,
        payload: &Payload,
    ) -> anyhow::Result<Option<Payload>>;
}

#[async_trait]
impl<F> WebSocketHook for F
where
    F: for<'a> Fn(&'a RequestSnapshot, Direction, &'a Payload) -> BoxFuture<'a, anyhow::Result<Option<Payload>>>
        + Send
        + Sync,
{
    async fn on_message(
        &self,
        request: &RequestSnapshot,
        direction: Direction,
        payload: &Payload,
    ) -> anyhow::Result<Option<Payload>> {
        self(request, direction, payload).await
    }
}

// Closures need the bound spelled out at the call site for their lifetimes to be inferred.

pub fn request_hook<F>(f: F) -> Arc<dyn RequestHook>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, anyhow::Result<RequestAction>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

pub fn response_hook<F>(f: F) -> Arc<dyn ResponseHook>
where
    F: for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, anyhow::Result<ResponseAction>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

pub fn websocket_hook<F>(f: F) -> Arc<dyn WebSocketHook>
where
    F: for<'a> Fn(&'a RequestSnapshot, Direction, &'a Payload) -> BoxFuture<'a, anyhow::Result<Option<Payload>>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}
