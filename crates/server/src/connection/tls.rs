//! TLS negotiation for `rediss://` connections.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use redis::{ClientTlsConfig, TlsCertificates};

/// Substrings (lowercased) that identify certificate validation failures,
/// as opposed to plain connectivity problems.
const CERTIFICATE_ERROR_MARKERS: &[&str] = &[
    "unable_to_verify_leaf_signature",
    "unable_to_get_issuer_cert",
    "unable_to_get_issuer_cert_locally",
    "self_signed_cert_in_chain",
    "depth_zero_self_signed_cert",
    "cert_has_expired",
    "cert_not_yet_valid",
    "cert_untrusted",
    "err_tls_cert_altname_invalid",
    "invalid peer certificate",
    "unknownissuer",
    "notvalidforname",
    "certificate verify failed",
    "certificate has expired",
    "self signed certificate",
    "self-signed certificate",
    "bad certificate",
    "unknown ca",
];

/// TLS settings applied when the Redis URL uses the `rediss` scheme.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Verify the server certificate chain and host name.
    pub reject_unauthorized: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            reject_unauthorized: true,
            ca_cert: None,
            client_cert: None,
            client_key: None,
        }
    }
}

impl TlsOptions {
    pub fn is_mutual(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }
}

/// True when the URL asks for a TLS connection (`rediss://`, any case).
pub fn is_tls_connection(url: &str) -> bool {
    url.trim_start()
        .get(..9)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("rediss://"))
}

/// True when an error message describes a certificate problem.
pub fn is_tls_certificate_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    CERTIFICATE_ERROR_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Build a Redis client, attaching certificates for `rediss://` URLs.
pub fn build_client(url: &str, tls: &TlsOptions) -> Result<redis::Client> {
    if !is_tls_connection(url) {
        return redis::Client::open(url).context("invalid Redis URL");
    }

    let url = if tls.reject_unauthorized || url.contains('#') {
        url.to_string()
    } else {
        tracing::warn!("Redis TLS certificate verification is disabled");
        format!("{}#insecure", url)
    };

    let root_cert = tls.ca_cert.as_deref().map(read_pem).transpose()?;
    let client_tls = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => Some(ClientTlsConfig {
            client_cert: read_pem(cert)?,
            client_key: read_pem(key)?,
        }),
        (None, None) => None,
        _ => bail!("Redis mutual TLS needs both a client certificate and a client key"),
    };

    if root_cert.is_none() && client_tls.is_none() {
        return redis::Client::open(url).context("invalid Redis URL");
    }

    tracing::info!(
        custom_ca = root_cert.is_some(),
        mutual_tls = client_tls.is_some(),
        "configuring Redis TLS"
    );

    redis::Client::build_with_tls(
        url,
        TlsCertificates {
            client_tls,
            root_cert,
        },
    )
    .context("invalid Redis TLS configuration")
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}
