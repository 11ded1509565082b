use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse {path}: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {path}"
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse {path}: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {path}")))
}

/// Builds the listener side config for one certificate/key pair.
///
/// A mismatched pair is rejected here rather than at the first handshake.
pub(crate) fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<Arc<ServerConfig>, Error> {
    let cert_chain = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Builds the client side config trusting the certificates in `ca_cert_path`.
pub(crate) fn load_tls_client_config(ca_cert_path: &str) -> Result<Arc<ClientConfig>, Error> {
    let mut root_cert_store = RootCertStore::empty();
    for cert in load_certificates(ca_cert_path)? {
        root_cert_store
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
