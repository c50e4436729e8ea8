use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::error::BoxError;

/// First stage of a chain. Yields chunks until `None`.
#[async_trait]
pub trait Source: Send {
    fn name(&self) -> &'static str {
        "source"
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>>;

    /// Forcibly release whatever the source reads from.
    fn destroy(&mut self) {}
}

/// Middle stage. May hold chunks back (returning `None`) and release them on `flush`.
#[async_trait]
pub trait Transform: Send {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn transform(&mut self, chunk: Bytes) -> Result<Option<Bytes>, BoxError>;

    /// Called once after the source is exhausted.
    async fn flush(&mut self) -> Result<Option<Bytes>, BoxError> {
        Ok(None)
    }

    fn destroy(&mut self) {}
}

/// Last stage of a chain.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &'static str {
        "sink"
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), BoxError>;

    async fn finish(&mut self) -> Result<(), BoxError>;

    /// Resolves once the consumer behind this sink is gone. Never resolves by default.
    async fn closed(&mut self) {
        std::future::pending::<()>().await
    }

    fn destroy(&mut self) {}
}

#[derive(Debug, Error)]
#[error("stage #{index} `{stage}` failed: {source}")]
pub struct ChainError {
    pub stage: &'static str,
    pub index: usize,
    #[source]
    pub source: BoxError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageStatus {
    Active,
    Finished,
    Errored,
    Destroyed,
}

/// Stages collected so far, before a sink is known.
pub struct ChainBuilder {
    source: Box<dyn Source>,
    transforms: Vec<Box<dyn Transform>>,
}

impl ChainBuilder {
    pub fn transform<T: Transform + 'static>(self, transform: T) -> Self {
        self.transform_boxed(Box::new(transform))
    }

    pub fn transform_boxed(mut self, transform: Box<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn push<T: Transform + 'static>(&mut self, transform: T) {
        self.transforms.push(Box::new(transform));
    }

    /// Swap the source, destroying the previous one.
    pub fn replace_source(&mut self, source: Box<dyn Source>) {
        let mut previous = std::mem::replace(&mut self.source, source);
        previous.destroy();
    }

    pub fn stage_count(&self) -> usize {
        self.transforms.len() + 1
    }

    /// Tear down every stage built so far without running them.
    pub fn destroy(mut self) {
        self.source.destroy();
        for transform in self.transforms.iter_mut() {
            transform.destroy();
        }
    }

    pub fn sink<S: Sink + 'static>(self, sink: S) -> StreamChain {
        self.sink_boxed(Box::new(sink))
    }

    pub fn sink_boxed(self, sink: Box<dyn Sink>) -> StreamChain {
        StreamChain::new(self.source, self.transforms, sink)
    }
}

/// source → transform* → sink, driven by a single task.
///
/// The driver awaits each stage in turn, so a slow sink stalls the source and chunk order
/// is preserved. The first failure wins: every other stage that has neither finished nor
/// errored is destroyed exactly once, and that single error is returned.
pub struct StreamChain {
    source: Box<dyn Source>,
    transforms: Vec<Box<dyn Transform>>,
    sink: Box<dyn Sink>,
    status: Vec<StageStatus>,
    torn_down: bool,
}

enum Pulled {
    Chunk(Option<Result<Bytes, BoxError>>),
    SinkClosed,
}

impl StreamChain {
    pub fn builder<S: Source + 'static>(source: S) -> ChainBuilder {
        Self::builder_boxed(Box::new(source))
    }

    pub fn builder_boxed(source: Box<dyn Source>) -> ChainBuilder {
        ChainBuilder {
            source,
            transforms: Vec::new(),
        }
    }

    pub fn new(
        source: Box<dyn Source>,
        transforms: Vec<Box<dyn Transform>>,
        sink: Box<dyn Sink>,
    ) -> Self {
        let status = vec![StageStatus::Active; transforms.len() + 2];
        Self {
            source,
            transforms,
            sink,
            status,
            torn_down: false,
        }
    }

    /// Number of stages, source and sink included.
    pub fn stage_count(&self) -> usize {
        self.status.len()
    }

    pub async fn run(mut self) -> Result<(), ChainError> {
        match self.pump().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.teardown();
                Err(err)
            }
        }
    }

    fn sink_index(&self) -> usize {
        self.transforms.len() + 1
    }

    async fn pump(&mut self) -> Result<(), ChainError> {
        loop {
            let pulled = tokio::select! {
                biased;
                next = self.source.next_chunk() => Pulled::Chunk(next),
                _ = self.sink.closed() => Pulled::SinkClosed,
            };

            let chunk = match pulled {
                Pulled::SinkClosed => {
                    let index = self.sink_index();
                    return Err(self.error_at(index, "consumer went away".into()));
                }
                Pulled::Chunk(None) => {
                    self.status[0] = StageStatus::Finished;
                    break;
                }
                Pulled::Chunk(Some(Err(err))) => return Err(self.error_at(0, err)),
                Pulled::Chunk(Some(Ok(chunk))) => chunk,
            };

            self.forward(chunk, 0).await?;
        }

        for i in 0..self.transforms.len() {
            let flushed = match self.transforms[i].flush().await {
                Ok(flushed) => flushed,
                Err(err) => return Err(self.error_at(i + 1, err)),
            };
            self.status[i + 1] = StageStatus::Finished;

            if let Some(chunk) = flushed {
                self.forward(chunk, i + 1).await?;
            }
        }

        let index = self.sink_index();
        if let Err(err) = self.sink.finish().await {
            return Err(self.error_at(index, err));
        }
        self.status[index] = StageStatus::Finished;

        Ok(())
    }

    /// Push `chunk` through `transforms[first..]` and then into the sink.
    async fn forward(&mut self, mut chunk: Bytes, first: usize) -> Result<(), ChainError> {
        for i in first..self.transforms.len() {
            match self.transforms[i].transform(chunk).await {
                Ok(Some(out)) => chunk = out,
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.error_at(i + 1, err)),
            }
        }

        if chunk.is_empty() {
            return Ok(());
        }

        if let Err(err) = self.sink.write(chunk).await {
            let index = self.sink_index();
            return Err(self.error_at(index, err));
        }

        Ok(())
    }

    fn stage_name(&self, index: usize) -> &'static str {
        if index == 0 {
            self.source.name()
        } else if index == self.sink_index() {
            self.sink.name()
        } else {
            self.transforms[index - 1].name()
        }
    }

    fn error_at(&mut self, index: usize, source: BoxError) -> ChainError {
        self.status[index] = StageStatus::Errored;
        ChainError {
            stage: self.stage_name(index),
            index,
            source,
        }
    }

    fn teardown(&mut self) {
        if std::mem::replace(&mut self.torn_down, true) {
            return;
        }

        let sink_index = self.sink_index();
        for index in 0..self.status.len() {
            if self.status[index] != StageStatus::Active {
                continue;
            }
            self.status[index] = StageStatus::Destroyed;
            trace!(stage = self.stage_name(index), index, "destroying stage");

            if index == 0 {
                self.source.destroy();
            } else if index == sink_index {
                self.sink.destroy();
            } else {
                self.transforms[index - 1].destroy();
            }
        }
    }
}
