//! LOGOUT command handler.
//!
//! Counts the logout so tests can check that the probe ends sessions
//! cleanly, then sends BYE followed by the tagged OK.

use crate::fake_imap::io::write_line;
use crate::fake_imap::server::Stats;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn handle_logout<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    stats: &Stats,
    stream: &mut BufReader<S>,
) {
    stats.logouts.fetch_add(1, Ordering::SeqCst);
    let _ = write_line(stream, "* BYE Logging out\r\n").await;
    let resp = format!("{tag} OK LOGOUT completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn counts_and_says_bye_first() {
        let stats = Stats::default();
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);

        handle_logout("X1", &stats, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        BufReader::new(client).read_to_end(&mut buf).await.unwrap();
        let output = String::from_utf8(buf).unwrap();

        assert_eq!(stats.logouts.load(Ordering::SeqCst), 1);
        assert!(output.find("* BYE").unwrap() < output.find("X1 OK").unwrap());
    }
}
