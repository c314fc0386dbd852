//! Fake IMAP server for integration testing
//!
//! This module provides an in-process IMAP server that speaks just
//! enough of the protocol for a login probe:
//!
//! TCP -> [greeting -> STARTTLS ->] TLS handshake -> [greeting ->] LOGIN -> LOGOUT
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, TLS setup, connection dispatch, counters
//! - `handlers/` -- one file per IMAP command (LOGIN, LOGOUT, STARTTLS)
//! - `io` -- shared write helpers

#![allow(dead_code)]

mod handlers;
mod io;
mod server;

#[allow(unused_imports)]
pub use server::{FakeImapServer, LoginBehavior, SERVER_NAME, TlsMode};
