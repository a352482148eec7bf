use openssl::ssl::{SslAcceptor, SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("openssl error")]
    Openssl(#[from] openssl::error::ErrorStack),
    #[error("io error on {}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Certificate material one endpoint presents and trusts. Both sides of a
/// connection authenticate: the server verifies worker certificates against
/// `ca` and vice versa.
#[derive(Clone, Debug)]
pub struct TlsIdentity {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

fn trusted_store(ca: &Path) -> Result<openssl::x509::store::X509Store, TlsSetupError> {
    let pem = std::fs::read(ca).map_err(|source| TlsSetupError::Io {
        source,
        path: ca.to_path_buf(),
    })?;
    let ca_cert = openssl::x509::X509::from_pem(&pem)?;
    let mut store = openssl::x509::store::X509StoreBuilder::new()?;
    store.add_cert(ca_cert)?;
    Ok(store.build())
}

/// Builds the server-side acceptor: mozilla-modern profile, peer certificate
/// required.
pub fn acceptor(identity: &TlsIdentity) -> Result<SslAcceptor, TlsSetupError> {
    let mut builder = SslAcceptor::mozilla_modern(SslMethod::tls())?;
    builder.set_certificate_chain_file(&identity.cert)?;
    builder.set_private_key_file(&identity.key, SslFiletype::PEM)?;
    builder.check_private_key()?;
    builder.set_verify_cert_store(trusted_store(&identity.ca)?)?;
    builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    Ok(builder.build())
}

/// Builds the worker-side connector presenting its own certificate.
pub fn connector(identity: &TlsIdentity) -> Result<SslConnector, TlsSetupError> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_certificate_chain_file(&identity.cert)?;
    builder.set_private_key_file(&identity.key, SslFiletype::PEM)?;
    builder.check_private_key()?;
    builder.set_verify_cert_store(trusted_store(&identity.ca)?)?;
    builder.set_verify(SslVerifyMode::PEER);
    Ok(builder.build())
}
