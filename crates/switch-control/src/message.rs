//! Event-socket framing
//!
//! Every frame is a block of `Name: value` header lines terminated by an
//! empty line. When a `Content-Length` header is present, exactly that many
//! bytes of body follow the header block.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Result, SwitchError};

/// Content types the switch sends us
pub mod content_type {
    pub const AUTH_REQUEST: &str = "auth/request";
    pub const COMMAND_REPLY: &str = "command/reply";
    pub const API_RESPONSE: &str = "api/response";
    pub const EVENT_PLAIN: &str = "text/event-plain";
    pub const DISCONNECT_NOTICE: &str = "text/disconnect-notice";
    pub const RUDE_REJECTION: &str = "text/rude-rejection";
}

/// Refuse bodies larger than this; a real switch never sends anything close.
const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// One frame read off the socket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EslMessage {
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl EslMessage {
    /// Build a message from raw parts
    pub fn new(headers: Vec<(String, String)>, body: Option<String>) -> Self {
        Self { headers, body }
    }

    /// Look up a header, ignoring ASCII case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers in wire order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.header("Reply-Text")
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// True when either the reply text or the body reports `-ERR`
    pub fn is_error(&self) -> bool {
        self.reply_text().is_some_and(|t| t.starts_with("-ERR"))
            || self.body().is_some_and(|b| b.trim_start().starts_with("-ERR"))
    }

    /// The human readable outcome: reply text for command replies, the
    /// trimmed body for api responses
    pub fn outcome(&self) -> String {
        match (self.reply_text(), self.body()) {
            (Some(text), _) => text.to_string(),
            (None, Some(body)) => body.trim().to_string(),
            (None, None) => String::new(),
        }
    }
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<EslMessage>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            if headers.is_empty() {
                return Ok(None);
            }
            return Err(SwitchError::protocol("connection closed inside a header block"));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if headers.is_empty() {
                continue;
            }
            break;
        }

        match trimmed.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
            None => {
                return Err(SwitchError::protocol(format!(
                    "malformed header line: {}",
                    trimmed
                )))
            }
        }
    }

    let mut message = EslMessage::new(headers, None);
    if let Some(length) = message.header("Content-Length") {
        let length: usize = length
            .parse()
            .map_err(|_| SwitchError::protocol(format!("bad Content-Length: {}", length)))?;
        if length > MAX_BODY_LEN {
            return Err(SwitchError::protocol(format!("body of {} bytes is too large", length)));
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        message.body = Some(String::from_utf8_lossy(&body).into_owned());
    }

    Ok(Some(message))
}

/// Encode a command with optional extra header lines
pub fn encode_command(command: &str, headers: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(command.len() + 2 + headers.len() * 32);
    out.push_str(command);
    out.push('\n');
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_reads_header_only_frame() {
        let raw = b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n";
        let mut reader = BufReader::new(&raw[..]);
        let msg = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(msg.content_type(), Some(content_type::COMMAND_REPLY));
        assert_eq!(msg.reply_text(), Some("+OK accepted"));
        assert!(!msg.is_error());
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_body_by_content_length() {
        let raw = b"Content-Type: api/response\nContent-Length: 14\n\n3 total.\n\nnextContent-Type: command/reply\nReply-Text: -ERR no\n\n";
        let mut reader = BufReader::new(&raw[..]);
        let first = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.body(), Some("3 total.\n\nnext"));
        assert_eq!(first.outcome(), "3 total.\n\nnext");

        let second = read_message(&mut reader).await.unwrap().unwrap();
        assert!(second.is_error());
    }

    #[tokio::test]
    async fn test_truncated_header_block_is_an_error() {
        let raw = b"Content-Type: command/reply\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            read_message(&mut reader).await,
            Err(SwitchError::Protocol { .. })
        ));
    }

    #[test]
    fn test_encode_command_with_headers() {
        let encoded = encode_command("bgapi status", &[("Job-UUID", "abc")]);
        assert_eq!(encoded, "bgapi status\nJob-UUID: abc\n\n");
        assert_eq!(encode_command("myevents", &[]), "myevents\n\n");
    }
}
