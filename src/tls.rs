//! Fixed TLS material baked into the binary.
//!
//! The listener always presents the embedded server certificate; the dialer
//! trusts exactly the embedded CA. Peer authentication is certificate-based,
//! not identity-based: any peer presenting a certificate signed by this CA
//! is accepted, and the dialer always verifies against the fixed
//! [`TLS_SERVER_NAME`] rather than the peer's IP.

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::TransferError;

static CA_CERT_PEM: &[u8] = include_bytes!("../certs/ca-cert.pem");
static SERVER_CERT_PEM: &[u8] = include_bytes!("../certs/server-cert.pem");
static SERVER_KEY_PEM: &[u8] = include_bytes!("../certs/server-key.pem");

/// Name the embedded server certificate is issued for.
pub const TLS_SERVER_NAME: &str = "lanbeam";

fn parse_certs(mut pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransferError> {
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TransferError::Io)?;
    if certs.is_empty() {
        return Err(TransferError::ConfigError(
            "no certificate found in embedded PEM".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_key(mut pem: &[u8]) -> Result<PrivateKeyDer<'static>, TransferError> {
    rustls_pemfile::private_key(&mut pem)
        .map_err(TransferError::Io)?
        .ok_or_else(|| {
            TransferError::ConfigError("no private key found in embedded PEM".to_string())
        })
}

/// Acceptor for the listener role, presenting the embedded certificate.
pub fn acceptor() -> Result<TlsAcceptor, TransferError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(parse_certs(SERVER_CERT_PEM)?, parse_key(SERVER_KEY_PEM)?)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for the dialer role, trusting only the embedded CA.
pub fn connector() -> Result<TlsConnector, TransferError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(CA_CERT_PEM)? {
        roots
            .add(cert)
            .map_err(TransferError::Tls)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The fixed name the dialer verifies the peer certificate against.
pub fn server_name() -> Result<ServerName<'static>, TransferError> {
    ServerName::try_from(TLS_SERVER_NAME.to_string())
        .map_err(|_| TransferError::ConfigError("invalid embedded server name".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_server_material_builds_acceptor() {
        acceptor().unwrap();
    }

    #[test]
    fn test_embedded_ca_builds_connector() {
        connector().unwrap();
    }

    #[test]
    fn test_server_name_parses() {
        server_name().unwrap();
    }

    #[test]
    fn test_embedded_pems_parse() {
        assert!(!parse_certs(CA_CERT_PEM).unwrap().is_empty());
        assert!(!parse_certs(SERVER_CERT_PEM).unwrap().is_empty());
        parse_key(SERVER_KEY_PEM).unwrap();
    }
}
