use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, crypto::ring, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Client side TLS for outbound connections.
///
/// Trust anchors are the webpki roots plus whatever `upstream.cacert-file` brought in.
/// Two configurations are kept: one offering `h2` and `http/1.1` over ALPN, one offering
/// `http/1.1` only (used when a hook turns `auto_http2` off, and for WebSockets).
#[derive(Clone)]
pub struct UpstreamTls {
    auto: Arc<ClientConfig>,
    http1: Arc<ClientConfig>,
}

fn client_config(roots: RootCertStore, alpn: &[&[u8]]) -> Result<Arc<ClientConfig>, rustls::Error> {
    let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

impl UpstreamTls {
    pub fn new(extra_roots: Option<&RootCertStore>) -> Result<Self, rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(extra) = extra_roots {
            roots.roots.extend(extra.roots.iter().cloned());
        }

        Ok(Self {
            auto: client_config(roots.clone(), &[ALPN_H2, ALPN_HTTP1])?,
            http1: client_config(roots, &[ALPN_HTTP1])?,
        })
    }

    pub fn config(&self, auto_http2: bool) -> Arc<ClientConfig> {
        if auto_http2 {
            self.auto.clone()
        } else {
            self.http1.clone()
        }
    }

    /// Performs the TLS handshake over an already connected stream.
    pub async fn connect<IO: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: IO,
        server_name: &str,
        auto_http2: bool,
    ) -> std::io::Result<TlsStream<IO>> {
        let domain = ServerName::try_from(server_name.to_owned()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid server name \"{server_name}\""),
            )
        })?;

        debug!("Performing a TLS connection to {domain:?}...");
        let connector = TlsConnector::from(self.config(auto_http2));
        connector.connect(domain, stream).await
    }
}

pub fn negotiated_h2<IO>(stream: &TlsStream<IO>) -> bool {
    stream.get_ref().1.alpn_protocol() == Some(ALPN_H2)
}
