//! Shared I/O helpers for the fake IMAP server.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Write a string to the stream and flush.
pub async fn write_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &str,
) -> std::io::Result<()> {
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().flush().await
}

/// Split a command line into `(tag, COMMAND, rest)`.
pub fn split_command(line: &str) -> Option<(&str, String, &str)> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(3, ' ');
    let tag = parts.next().filter(|t| !t.is_empty())?;
    let command = parts.next()?.to_ascii_uppercase();
    Some((tag, command, parts.next().unwrap_or("")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_tag_command_and_arguments() {
        assert_eq!(
            split_command("A0001 login \"u\" \"p\"\r\n"),
            Some(("A0001", "LOGIN".to_string(), "\"u\" \"p\""))
        );
        assert_eq!(
            split_command("A2 LOGOUT\r\n"),
            Some(("A2", "LOGOUT".to_string(), ""))
        );
        assert_eq!(split_command("\r\n"), None);
    }
}
