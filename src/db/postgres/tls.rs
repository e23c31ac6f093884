use std::path::Path;

use postgres_native_tls::MakeTlsConnector;

use crate::error::{DalError, Result};
use crate::uri::ConnectionUri;

/// The `sslmode` URI option.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn from_uri(uri: &ConnectionUri) -> Result<Self> {
        Ok(match uri.option("sslmode") {
            None | Some("prefer") => SslMode::Prefer,
            Some("disable") => SslMode::Disable,
            Some("require") => SslMode::Require,
            Some("verify-ca") => SslMode::VerifyCa,
            Some("verify-full") => SslMode::VerifyFull,
            Some(other) => {
                return Err(DalError::InvalidUri(format!("unknown sslmode {other:?}")))
            }
        })
    }

    pub fn strict(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> DalError {
    DalError::Config(format!("{context}: {err}"))
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// `sslrootcert` names a PEM bundle of extra trusted roots. `sslaccept=invalid`
/// skips verification, and is ignored for the verify modes.
pub fn build_tls_connector(uri: &ConnectionUri, mode: SslMode) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if uri.option("sslaccept") == Some("invalid") && !mode.strict() {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else {
        if let Some(path) = uri.option("sslrootcert") {
            add_ca_certificates(&mut builder, Path::new(path))?;
        }
        if mode == SslMode::VerifyCa {
            builder.danger_accept_invalid_hostnames(true);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| tls_error("failed to build TLS connector", e))?;
    Ok(MakeTlsConnector::new(connector))
}

fn add_ca_certificates(builder: &mut native_tls::TlsConnectorBuilder, path: &Path) -> Result<()> {
    let pem = std::fs::read(path)?;
    let certs = split_pem(&pem)?;
    for cert in certs {
        let cert = native_tls::Certificate::from_pem(cert.as_bytes())
            .map_err(|e| tls_error("failed to parse certificate", e))?;
        builder.add_root_certificate(cert);
    }
    Ok(())
}

/// Split a PEM bundle into one PEM block per certificate.
fn split_pem(pem: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(pem)
        .map_err(|e| tls_error("CA certificate file is not valid UTF-8", e))?;

    let mut certs = Vec::new();
    let mut current = String::new();
    let mut in_cert = false;
    for line in text.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            in_cert = true;
            current.clear();
        }
        if in_cert {
            current.push_str(line.trim());
            current.push('\n');
        }
        if line.contains("-----END CERTIFICATE-----") && in_cert {
            in_cert = false;
            certs.push(std::mem::take(&mut current));
        }
    }

    if certs.is_empty() {
        return Err(DalError::Config("no certificates found in PEM data".into()));
    }
    Ok(certs)
}
