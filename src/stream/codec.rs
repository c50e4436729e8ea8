use std::io::Write;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BoxError, InterceptError};
use crate::stream::chain::Transform;

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Content codings a response body can be decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Br,
}

impl ContentCoding {
    /// `Ok(None)` means identity: nothing to decode.
    pub fn parse(token: &str) -> Result<Option<ContentCoding>, InterceptError> {
        let token = token.trim().to_ascii_lowercase();
        match token.as_str() {
            "" | "identity" => Ok(None),
            "gzip" | "x-gzip" => Ok(Some(ContentCoding::Gzip)),
            "deflate" => Ok(Some(ContentCoding::Deflate)),
            "br" => Ok(Some(ContentCoding::Br)),
            _ => Err(InterceptError::UnsupportedEncoding(token)),
        }
    }

    pub fn decoder(self) -> Decoder {
        Decoder::new(self)
    }
}

enum Inner {
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
    Br(Box<brotli::DecompressorWriter<Vec<u8>>>),
}

/// Streaming decoder stage; emits whatever each compressed chunk decodes to.
pub struct Decoder {
    coding: ContentCoding,
    inner: Option<Inner>,
}

impl Decoder {
    pub fn new(coding: ContentCoding) -> Self {
        let inner = match coding {
            ContentCoding::Gzip => Inner::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            ContentCoding::Deflate => Inner::Deflate(flate2::write::ZlibDecoder::new(Vec::new())),
            ContentCoding::Br => Inner::Br(Box::new(brotli::DecompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER_SIZE,
            ))),
        };

        Self {
            coding,
            inner: Some(inner),
        }
    }

    fn decode(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(std::io::Error::other("decoder already finished"));
        };

        let out = match inner {
            Inner::Gzip(d) => {
                d.write_all(chunk)?;
                d.flush()?;
                std::mem::take(d.get_mut())
            }
            Inner::Deflate(d) => {
                d.write_all(chunk)?;
                d.flush()?;
                std::mem::take(d.get_mut())
            }
            Inner::Br(d) => {
                d.write_all(chunk)?;
                d.flush()?;
                std::mem::take(d.get_mut())
            }
        };

        Ok(out)
    }

    fn finish(&mut self) -> std::io::Result<Vec<u8>> {
        match self.inner.take() {
            None => Ok(Vec::new()),
            Some(Inner::Gzip(d)) => d.finish(),
            Some(Inner::Deflate(d)) => d.finish(),
            Some(Inner::Br(d)) => d
                .into_inner()
                .map_err(|_| std::io::Error::other("truncated brotli stream")),
        }
    }
}

fn non_empty(out: Vec<u8>) -> Option<Bytes> {
    if out.is_empty() {
        None
    } else {
        Some(Bytes::from(out))
    }
}

#[async_trait]
impl Transform for Decoder {
    fn name(&self) -> &'static str {
        match self.coding {
            ContentCoding::Gzip => "gunzip",
            ContentCoding::Deflate => "inflate",
            ContentCoding::Br => "brotli-decompress",
        }
    }

    async fn transform(&mut self, chunk: Bytes) -> Result<Option<Bytes>, BoxError> {
        Ok(non_empty(self.decode(&chunk)?))
    }

    async fn flush(&mut self) -> Result<Option<Bytes>, BoxError> {
        Ok(non_empty(self.finish()?))
    }

    fn destroy(&mut self) {
        self.inner = None;
    }
}
