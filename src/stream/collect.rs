use std::future::Future;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::BoxError;
use crate::stream::chain::Transform;

/// Receives a whole body and returns its replacement.
pub type CollectFn = Box<dyn FnOnce(Bytes) -> BoxFuture<'static, anyhow::Result<Bytes>> + Send>;

/// Box an async closure into a [`CollectFn`]. The closure may return text or bytes.
pub fn collect_fn<F, Fut, T>(f: F) -> CollectFn
where
    F: FnOnce(Bytes) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Into<Bytes>,
{
    Box::new(move |payload| f(payload).map(|out| out.map(Into::into)).boxed())
}

/// Buffers every chunk, then emits whatever the collect function made of them.
pub struct CollectTransform {
    buffer: BytesMut,
    handler: Option<CollectFn>,
}

impl CollectTransform {
    pub fn new(handler: CollectFn) -> Self {
        Self {
            buffer: BytesMut::new(),
            handler: Some(handler),
        }
    }
}

#[async_trait]
impl Transform for CollectTransform {
    fn name(&self) -> &'static str {
        "collect"
    }

    async fn transform(&mut self, chunk: Bytes) -> Result<Option<Bytes>, BoxError> {
        self.buffer.extend_from_slice(&chunk);
        Ok(None)
    }

    async fn flush(&mut self) -> Result<Option<Bytes>, BoxError> {
        let handler = self.handler.take().ok_or("collect already flushed")?;
        let payload = std::mem::take(&mut self.buffer).freeze();
        let replacement = handler(payload).await.map_err(BoxError::from)?;
        Ok(Some(replacement))
    }

    fn destroy(&mut self) {
        self.handler = None;
        self.buffer.clear();
    }
}
