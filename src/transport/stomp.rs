//! STOMP 1.2 frame codec.
//!
//! The broker speaks STOMP over WebSocket text messages: a command line,
//! header lines, a blank line, then the body terminated by a NUL byte.
//! A bare `\n` is a heartbeat, not a frame.

use thiserror::Error;

/// Heartbeat payload exchanged in both directions.
pub const HEARTBEAT: &str = "\n";

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
}

/// STOMP commands used by this client and the brokers it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CodecError> {
        match s {
            "CONNECT" | "STOMP" => Ok(Command::Connect),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "SEND" => Ok(Command::Send),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            "DISCONNECT" => Ok(Command::Disconnect),
            other => Err(CodecError::UnknownCommand(other.to_string())),
        }
    }

    /// CONNECT and CONNECTED frames do not use header escaping (STOMP 1.2).
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for a header name, if present.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to the wire format, NUL terminator included.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::new();
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse a frame from a WebSocket text payload.
    ///
    /// Returns `Ok(None)` for heartbeats. A missing NUL terminator is
    /// tolerated; some brokers omit it on ERROR frames.
    pub fn decode(raw: &str) -> Result<Option<Frame>, CodecError> {
        let raw = raw.trim_end_matches('\0');
        if raw.is_empty() || raw == "\n" || raw == "\r\n" {
            return Ok(None);
        }

        let mut lines = raw.split('\n');
        let command_line = lines.next().ok_or(CodecError::Empty)?;
        let command = Command::parse(command_line.trim_end_matches('\r'))?;
        let unescape_headers = command.escapes_headers();

        let mut headers = Vec::new();
        let mut body_offset = command_line.len() + 1;
        for line in lines.by_ref() {
            let line_len = line.len() + 1;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                body_offset += line_len;
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
            if unescape_headers {
                headers.push((unescape_header(name), unescape_header(value)));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
            body_offset += line_len;
        }

        let body = if body_offset <= raw.len() {
            raw[body_offset..].to_string()
        } else {
            String::new()
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            // Undefined escape: keep it verbatim rather than dropping bytes.
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
