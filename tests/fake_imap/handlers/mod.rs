//! IMAP command handlers for the fake server.
//!
//! Each handler lives in its own module and processes a single IMAP
//! command (STARTTLS, LOGIN, LOGOUT).

mod logout;
mod starttls;

pub use login::{LoginReply, handle_login};
pub use logout::handle_logout;
pub use starttls::handle_starttls;
