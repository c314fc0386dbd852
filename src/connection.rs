//! IMAP connection and TLS helpers
//!
//! Turns a tunnelled TCP stream into an IMAP client speaking TLS,
//! either from the first byte (implicit TLS, port 993) or after a
//! STARTTLS upgrade.

use crate::error::{Error, Result};
use async_imap::Client;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::debug;

/// A TLS-wrapped IMAP client, not yet logged in.
pub type ImapClient = Client<Compat<TlsStream<TcpStream>>>;

/// TLS configuration trusting the Mozilla root set.
///
/// # Errors
///
/// Returns a TLS error if the crypto provider rejects the default
/// protocol versions.
pub fn default_tls_config() -> Result<Arc<ClientConfig>> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Wrap `stream` in TLS for `host` and hand it to async-imap.
///
/// With `implicit_tls` the handshake starts immediately; otherwise the
/// plaintext greeting is followed by `STARTTLS` first.
///
/// # Errors
///
/// Returns an error if the STARTTLS exchange fails, `host` is not a valid
/// server name, or the TLS handshake fails.
pub async fn open_client(
    stream: TcpStream,
    host: &str,
    implicit_tls: bool,
    tls: Arc<ClientConfig>,
) -> Result<ImapClient> {
    let stream = if implicit_tls {
        stream
    } else {
        starttls(stream).await?
    };

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;

    let tls_stream = TlsConnector::from(tls)
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    debug!("TLS established with {}", host);
    Ok(Client::new(tls_stream.compat()))
}

async fn starttls(stream: TcpStream) -> Result<TcpStream> {
    let mut client = Client::new(stream.compat());

    client
        .run_command_and_check_ok("STARTTLS", None)
        .await
        .map_err(|e| Error::Tls(format!("STARTTLS failed: {e}")))?;

    Ok(client.into_inner().into_inner())
}
