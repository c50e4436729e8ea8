use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, ServerConfig};

use crate::proxy::client_tls::{ALPN_H2, ALPN_HTTP1};
use crate::state::State;

#[derive(Debug, Error)]
pub enum ServerTLSConfigError {
    #[error("The HTTPS listener needs a TLS chain and a private key")]
    MissingServerCertificates,
    #[error("Setting the single certificates failed: {0}")]
    ServerCertificateConfigError(#[from] rustls::Error),
}

/// Acceptor for the HTTPS listener; `None` when no server certificate is loaded.
pub fn build_tls_acceptor(state: &State) -> Result<Option<TlsAcceptor>, ServerTLSConfigError> {
    let Some(ref certificates) = state.server_certificates else {
        return Ok(None);
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certificates.cert_chain.clone(), certificates.private_key.clone_key())?;

    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// Same as [`build_tls_acceptor`], but a missing certificate is an error.
pub fn require_tls_acceptor(state: &State) -> Result<TlsAcceptor, ServerTLSConfigError> {
    build_tls_acceptor(state)?.ok_or(ServerTLSConfigError::MissingServerCertificates)
}
