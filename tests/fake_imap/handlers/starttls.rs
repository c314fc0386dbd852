//! STARTTLS command handler.
//!
//! Runs on the plaintext stream right after the greeting. Anything but
//! STARTTLS is refused and the connection dropped.

use crate::fake_imap::io::{split_command, write_line};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

/// Read one command and accept it if it is STARTTLS. Returns whether
/// the caller should start the TLS handshake.
pub async fn handle_starttls<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
) -> bool {
    let mut line = String::new();
    if stream.read_line(&mut line).await.is_err() {
        return false;
    }
    let Some((tag, command, _)) = split_command(&line) else {
        return false;
    };

    if command != "STARTTLS" {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(stream, &resp).await;
        return false;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    write_line(stream, &resp).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn run(input: &str) -> (String, bool) {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(input.as_bytes()).await.unwrap();
        let mut stream = BufReader::new(server);

        let ok = handle_starttls(&mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        (String::from_utf8(buf).unwrap(), ok)
    }

    #[tokio::test]
    async fn accepts_starttls() {
        let (output, ok) = run("A0001 STARTTLS\r\n").await;
        assert!(ok);
        assert_eq!(output, "A0001 OK Begin TLS negotiation now\r\n");
    }

    #[tokio::test]
    async fn refuses_other_commands() {
        let (output, ok) = run("A0001 LOGIN u p\r\n").await;
        assert!(!ok);
        assert!(output.starts_with("A0001 BAD"));
    }
}
