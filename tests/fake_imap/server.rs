//! In-process fake IMAP server for integration testing
//!
//! # Connection lifecycle
//!
//! Providers offer TLS in one of two ways, and the server speaks both:
//!
//! ```text
//!   Implicit TLS (port 993)          STARTTLS (port 143)
//!   -----------------------          -------------------
//!   TCP connect                      TCP connect
//!   TLS handshake                    "* OK ready"
//!   "* OK ready"                     A0001 STARTTLS -> A0001 OK
//!                                    TLS handshake
//!   A0001 LOGIN "user" "pass"        A0001 LOGIN "user" "pass"
//!   A0001 OK / NO <reason>           A0001 OK / NO <reason>
//!   A0002 LOGOUT -> * BYE, OK        A0002 LOGOUT -> * BYE, OK
//! ```
//!
//! A refused login is answered with a tagged `NO` whose text is what
//! the probe must report verbatim, e.g.
//! `A0001 NO [AUTHENTICATIONFAILED] Invalid credentials (Failure)`.

use super::handlers::{LoginReply, handle_login, handle_logout, handle_starttls};
use super::io::{split_command, write_line};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Server name the certificate is issued for.
pub const SERVER_NAME: &str = "imap.test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Implicit,
    StartTls,
}

/// How the server answers a LOGIN.
#[derive(Debug, Clone)]
pub enum LoginBehavior {
    Accept,
    /// Tagged `NO` with this text.
    Reject(String),
    /// Never answer; wait for the client to hang up.
    Stall,
}

#[derive(Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub closed: AtomicUsize,
    pub logouts: AtomicUsize,
    pub logins: Mutex<Vec<(String, String)>>,
}

struct Shared {
    tls: TlsMode,
    /// One behavior per connection; the last one repeats.
    script: Vec<LoginBehavior>,
    stats: Stats,
}

impl Shared {
    fn behavior_for(&self, connection: usize) -> LoginBehavior {
        self.script
            .get(connection)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(LoginBehavior::Accept)
    }
}

/// A fake IMAP server on localhost with an OS-assigned port.
///
/// The certificate is generated at startup with `rcgen` for
/// [`SERVER_NAME`]; [`client_tls_config`](Self::client_tls_config)
/// returns a client configuration that trusts it.
pub struct FakeImapServer {
    port: u16,
    cert: CertificateDer<'static>,
    shared: Arc<Shared>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a server answering every LOGIN with `behavior`.
    pub async fn start(tls: TlsMode, behavior: LoginBehavior) -> Self {
        Self::with_script(tls, vec![behavior]).await
    }

    /// Start a server answering the n-th connection's LOGIN with
    /// `script[n]`, repeating the last entry.
    pub async fn with_script(tls: TlsMode, script: Vec<LoginBehavior>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let shared = Arc::new(Shared {
            tls,
            script,
            stats: Stats::default(),
        });

        let accept_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let shared = Arc::clone(&accept_shared);
                let n = shared.stats.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    handle_connection(stream, acceptor, &shared, n).await;
                    shared.stats.closed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            port,
            cert: cert_der,
            shared,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> &Stats {
        &self.shared.stats
    }

    /// Client configuration trusting only this server's certificate.
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).expect("add test root");
        Arc::new(
            ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth(),
        )
    }

    /// Wait until `n` connections have been closed, or give up after
    /// two seconds.
    pub async fn wait_closed(&self, n: usize) -> bool {
        for _ in 0..200 {
            if self.stats().closed.load(Ordering::SeqCst) >= n {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }
}

const GREETING: &str = "* OK IMAP4rev1 Fake server ready\r\n";

async fn handle_connection(
    stream: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    shared: &Shared,
    n: usize,
) {
    let behavior = shared.behavior_for(n);

    match shared.tls {
        TlsMode::Implicit => {
            let Ok(tls_stream) = acceptor.accept(stream).await else {
                return;
            };
            let mut reader = BufReader::new(tls_stream);
            if write_line(&mut reader, GREETING).await.is_err() {
                return;
            }
            handle_session(reader, &behavior, &shared.stats).await;
        }
        TlsMode::StartTls => {
            let mut reader = BufReader::new(stream);
            if write_line(&mut reader, GREETING).await.is_err() {
                return;
            }
            if !handle_starttls(&mut reader).await {
                return;
            }
            let Ok(tls_stream) = acceptor.accept(reader.into_inner()).await else {
                return;
            };
            handle_session(BufReader::new(tls_stream), &behavior, &shared.stats).await;
        }
    }
}

/// Command loop after TLS is up.
async fn handle_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    behavior: &LoginBehavior,
    stats: &Stats,
) {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let Some((tag, command, args)) = split_command(&line) else {
            continue;
        };

        match command.as_str() {
            "LOGIN" => match handle_login(tag, args, behavior, stats, &mut reader).await {
                LoginReply::Continue => {}
                LoginReply::Hangup => break,
            },
            "LOGOUT" => {
                handle_logout(tag, stats, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
