use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::BoxError;
use crate::stream::chain::{Sink, Source};

/// Body type handed to hyper on both legs.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const READ_CHUNK_SIZE: usize = 16 * 1024;
const BODY_CHANNEL_CAPACITY: usize = 16;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body<B: Into<Bytes>>(bytes: B) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Reads data frames out of a hyper body. Trailers are dropped.
pub struct BodySource<B> {
    body: Option<B>,
    label: &'static str,
}

impl<B> BodySource<B> {
    pub fn new(body: B, label: &'static str) -> Self {
        Self {
            body: Some(body),
            label,
        }
    }
}

#[async_trait]
impl<B> Source for BodySource<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    fn name(&self) -> &'static str {
        self.label
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        loop {
            let frame = match self.body.as_mut() {
                Some(body) => body.frame().await,
                None => return None,
            };

            match frame {
                None => {
                    self.body = None;
                    return None;
                }
                Some(Err(err)) => return Some(Err(err.into())),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Some(Ok(data));
                    }
                }
            }
        }
    }

    fn destroy(&mut self) {
        self.body = None;
    }
}

/// A replacement body supplied by a hook: static bytes, text, or any byte stream.
pub struct ByteSource {
    stream: Option<BoxStream<'static, Result<Bytes, BoxError>>>,
}

impl ByteSource {
    pub fn from_bytes<B: Into<Bytes>>(bytes: B) -> Self {
        let bytes = bytes.into();
        Self {
            stream: Some(stream::once(async move { Ok(bytes) }).boxed()),
        }
    }

    pub fn from_stream<S, E>(source: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            stream: Some(source.map(|item| item.map_err(Into::into)).boxed()),
        }
    }

    pub fn empty() -> Self {
        Self {
            stream: Some(stream::empty().boxed()),
        }
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("exhausted", &self.stream.is_none())
            .finish()
    }
}

impl From<&'static str> for ByteSource {
    fn from(s: &'static str) -> Self {
        ByteSource::from_bytes(s)
    }
}

impl From<String> for ByteSource {
    fn from(s: String) -> Self {
        ByteSource::from_bytes(s)
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(v: Vec<u8>) -> Self {
        ByteSource::from_bytes(v)
    }
}

impl From<Bytes> for ByteSource {
    fn from(b: Bytes) -> Self {
        ByteSource::from_bytes(b)
    }
}

#[async_trait]
impl Source for ByteSource {
    fn name(&self) -> &'static str {
        "replacement"
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        self.stream.as_mut()?.next().await
    }

    fn destroy(&mut self) {
        self.stream = None;
    }
}

/// Sink feeding the body of a request or response handed to hyper.
///
/// Ending without `finish` (destroyed or dropped) makes the body end with an error, so the
/// peer sees a truncated body instead of a clean end of stream. The flag is checked once the
/// channel is drained and does not depend on free capacity.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Result<Frame<Bytes>, BoxError>>>,
    label: &'static str,
    finished: Arc<AtomicBool>,
}

struct Frames {
    rx: mpsc::Receiver<Result<Frame<Bytes>, BoxError>>,
    finished: Arc<AtomicBool>,
    done: bool,
}

impl ChannelSink {
    pub fn channel(label: &'static str) -> (ChannelSink, ProxyBody) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let finished = Arc::new(AtomicBool::new(false));

        let state = Frames {
            rx,
            finished: finished.clone(),
            done: false,
        };
        let frames = stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            match state.rx.recv().await {
                Some(item) => Some((item, state)),
                None if state.finished.load(Ordering::Acquire) => None,
                None => {
                    state.done = true;
                    Some((Err(BoxError::from("body stream aborted")), state))
                }
            }
        });

        let sink = ChannelSink {
            tx: Some(tx),
            label,
            finished,
        };

        (sink, StreamBody::new(frames).boxed_unsync())
    }

    fn abort(&mut self) {
        self.tx = None;
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), BoxError> {
        let tx = self.tx.as_ref().ok_or("body channel already closed")?;
        tx.send(Ok(Frame::data(chunk)))
            .await
            .map_err(|_| BoxError::from("body receiver went away"))
    }

    async fn finish(&mut self) -> Result<(), BoxError> {
        self.finished.store(true, Ordering::Release);
        self.tx = None;
        Ok(())
    }

    async fn closed(&mut self) {
        match self.tx.as_ref() {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    fn destroy(&mut self) {
        self.abort();
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Raw read half of a relayed TCP stream.
pub struct ReaderSource<R> {
    reader: Option<R>,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> Source for ReaderSource<R> {
    fn name(&self) -> &'static str {
        "tcp-read"
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        let reader = self.reader.as_mut()?;
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

        match reader.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some(Ok(buf.freeze())),
            Err(err) => Some(Err(err.into())),
        }
    }

    fn destroy(&mut self) {
        self.reader = None;
    }
}

/// Raw write half of a relayed TCP stream. `finish` shuts the write side down.
pub struct WriterSink<W> {
    writer: Option<W>,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> Sink for WriterSink<W> {
    fn name(&self) -> &'static str {
        "tcp-write"
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), BoxError> {
        let writer = self.writer.as_mut().ok_or("writer already closed")?;
        writer.write_all(&chunk).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), BoxError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.writer = None;
    }
}
