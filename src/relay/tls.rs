// rustls configuration built from PEM files

use crate::relay::config::{TlsConfig, TlsServerConfig};
use crate::relay::error::{RelayError, RelayResult};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certificates(path: &Path) -> RelayResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_error(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, e))?;

    if certs.is_empty() {
        return Err(RelayError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> RelayResult<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| tls_error(path, e))
}

fn load_roots(path: &Path) -> RelayResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots.add(cert).map_err(|e| tls_error(path, e))?;
    }
    Ok(roots)
}

fn tls_error(path: &Path, e: impl std::fmt::Display) -> RelayError {
    RelayError::Config(format!("TLS material {}: {e}", path.display()))
}

/// Client configuration with mutual authentication.
pub fn client_config(tls: &TlsConfig) -> RelayResult<Arc<ClientConfig>> {
    let roots = load_roots(&tls.ca_certificate)?;
    let chain = load_certificates(&tls.certificate_chain)?;
    let key = load_private_key(&tls.private_key)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::Config(format!("TLS protocol setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| RelayError::Config(format!("invalid client certificate: {e}")))?;

    Ok(Arc::new(config))
}

/// Server configuration; client certificates are required when a client CA is set.
pub fn server_config(tls: &TlsServerConfig) -> RelayResult<Arc<ServerConfig>> {
    let chain = load_certificates(&tls.certificate_chain)?;
    let key = load_private_key(&tls.private_key)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::Config(format!("TLS protocol setup failed: {e}")))?;

    let builder = match &tls.client_ca {
        Some(ca) => {
            let roots = Arc::new(load_roots(ca)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
                .build()
                .map_err(|e| RelayError::Config(format!("invalid client CA: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(chain, key)
        .map_err(|e| RelayError::Config(format!("invalid server certificate: {e}")))?;

    Ok(Arc::new(config))
}
