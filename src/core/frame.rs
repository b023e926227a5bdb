//! STOMP frame codec
//!
//! Clients talk to the gateway with STOMP 1.2 text frames, one frame per
//! transport message. Only the commands the gateway understands are modelled;
//! anything else is a malformed frame.

use std::fmt;
use std::time::Duration;

use crate::constants::SERVER_NAME;
use crate::error::{GatewayError, Result};

/// A bare end-of-line, sent and received as a heart-beat
pub const HEARTBEAT: &str = "\n";

const NUL: char = '\0';

/// STOMP commands known to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Frames that only a server may send
    pub fn is_server_command(&self) -> bool {
        matches!(self, Self::Connected | Self::Message | Self::Receipt | Self::Error)
    }

    /// CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl std::str::FromStr for Command {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CONNECT" => Ok(Self::Connect),
            "STOMP" => Ok(Self::Stomp),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "ACK" => Ok(Self::Ack),
            "NACK" => Ok(Self::Nack),
            "DISCONNECT" => Ok(Self::Disconnect),
            "CONNECTED" => Ok(Self::Connected),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            other => Err(GatewayError::FrameParse(format!("Unknown command '{}'", other))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decoding one inbound text message
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Heartbeat,
    Frame(Frame),
}

/// A single STOMP frame
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

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of a header; the first occurrence wins
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    pub fn receipt(&self) -> Option<&str> {
        self.header("receipt")
    }

    /// CONNECTED reply for an accepted session
    pub fn connected(version: &str, session: &str, heart_beat: HeartBeat) -> Self {
        Self::new(Command::Connected)
            .with_header("version", version)
            .with_header("server", SERVER_NAME)
            .with_header("session", session)
            .with_header("heart-beat", heart_beat.to_string())
    }

    /// MESSAGE frame delivered through one subscription
    pub fn message(destination: &str, subscription: &str, message_id: &str, body: &str) -> Self {
        Self::new(Command::Message)
            .with_header("destination", destination)
            .with_header("subscription", subscription)
            .with_header("message-id", message_id)
            .with_header("content-type", "text/plain;charset=UTF-8")
            .with_header("content-length", body.len().to_string())
            .with_body(body)
    }

    pub fn receipt_for(receipt_id: &str) -> Self {
        Self::new(Command::Receipt).with_header("receipt-id", receipt_id)
    }

    pub fn error(message: &str, detail: &str) -> Self {
        Self::new(Command::Error)
            .with_header("message", message)
            .with_header("content-type", "text/plain;charset=UTF-8")
            .with_header("content-length", detail.len().to_string())
            .with_body(detail)
    }

    /// Decode one transport message into a frame or a heart-beat
    pub fn parse(text: &str) -> Result<Incoming> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(Incoming::Heartbeat);
        }

        let mut offset = 0;
        let mut lines = Vec::new();
        loop {
            let end = text[offset..]
                .find('\n')
                .map(|pos| pos + offset)
                .ok_or_else(|| GatewayError::FrameParse("Unterminated header section".to_string()))?;
            let line = &text[offset..end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            offset = end + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let (command_line, header_lines) = lines
            .split_first()
            .ok_or_else(|| GatewayError::FrameParse("Missing command".to_string()))?;
        let command: Command = command_line.parse()?;

        let mut headers = Vec::with_capacity(header_lines.len());
        for line in header_lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                GatewayError::FrameParse(format!("Header line without ':' in {} frame", command))
            })?;
            if command.escapes_headers() {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let frame = Self {
            command,
            headers,
            body: String::new(),
        };
        let remainder = &text[offset..];

        let (body, trailer) = match frame.header("content-length") {
            Some(raw) => {
                let length: usize = raw.trim().parse().map_err(|_| {
                    GatewayError::FrameParse(format!("Invalid content-length '{}'", raw))
                })?;
                let body = remainder.get(..length).ok_or_else(|| {
                    GatewayError::FrameParse("Body shorter than content-length".to_string())
                })?;
                let trailer = &remainder[length..];
                if !trailer.is_empty() && !trailer.starts_with(NUL) {
                    return Err(GatewayError::FrameParse(
                        "Body not terminated after content-length".to_string(),
                    ));
                }
                (body, trailer.strip_prefix(NUL).unwrap_or(trailer))
            }
            None => match remainder.find(NUL) {
                Some(pos) => (&remainder[..pos], &remainder[pos + 1..]),
                None => (remainder, ""),
            },
        };

        if !trailer.trim_matches(['\r', '\n']).is_empty() {
            return Err(GatewayError::FrameParse(
                "Unexpected data after end of frame".to_string(),
            ));
        }

        Ok(Incoming::Frame(Self {
            body: body.to_string(),
            ..frame
        }))
    }

    /// Encode the frame for the wire, NUL-terminated
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if self.command.escapes_headers() {
                out.push_str(&escape(name));
                out.push(':');
                out.push_str(&escape(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(GatewayError::FrameParse(format!(
                    "Invalid header escape '\\{}'",
                    other
                )))
            }
            None => {
                return Err(GatewayError::FrameParse(
                    "Dangling escape at end of header".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

/// A `heart-beat` header value, both intervals in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// Smallest interval at which the sender emits heart-beats (0 = never)
    pub outgoing_ms: u64,
    /// Desired interval at which the sender wants to receive them (0 = never)
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn parse(value: &str) -> Result<Self> {
        let (outgoing, incoming) = value
            .split_once(',')
            .ok_or_else(|| GatewayError::FrameParse(format!("Invalid heart-beat '{}'", value)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| GatewayError::FrameParse(format!("Invalid heart-beat '{}'", value)))
        };
        Ok(Self {
            outgoing_ms: parse(outgoing)?,
            incoming_ms: parse(incoming)?,
        })
    }

    /// Server side of the negotiation for a client's requested heart-beat
    pub fn negotiate(client: HeartBeat, ping_interval: Duration) -> HeartBeat {
        let ping_ms = ping_interval.as_millis() as u64;
        HeartBeat {
            outgoing_ms: match client.incoming_ms {
                0 => 0,
                wanted => wanted.max(ping_ms),
            },
            incoming_ms: match client.outgoing_ms {
                0 => 0,
                offered => offered.max(ping_ms),
            },
        }
    }

    /// Interval at which the server must emit heart-beats, if any
    pub fn outgoing_interval(&self) -> Option<Duration> {
        (self.outgoing_ms > 0).then(|| Duration::from_millis(self.outgoing_ms))
    }

    /// Interval at which the server expects heart-beats from the client, if any
    pub fn incoming_interval(&self) -> Option<Duration> {
        (self.incoming_ms > 0).then(|| Duration::from_millis(self.incoming_ms))
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        match Frame::parse(text).unwrap() {
            Incoming::Frame(frame) => frame,
            Incoming::Heartbeat => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_parse_send_frame() {
        let parsed = frame("SEND\ndestination:/app/new-order\n\nTable 5: Pizza\0");
        assert_eq!(parsed.command, Command::Send);
        assert_eq!(parsed.destination(), Some("/app/new-order"));
        assert_eq!(parsed.body, "Table 5: Pizza");
    }

    #[test]
    fn test_parse_crlf_and_trailing_eol() {
        let parsed = frame("SUBSCRIBE\r\nid:sub-0\r\ndestination:/topic/orders\r\n\r\n\0\n\n");
        assert_eq!(parsed.command, Command::Subscribe);
        assert_eq!(parsed.header("id"), Some("sub-0"));
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_heartbeat_only_text() {
        assert_eq!(Frame::parse("\n").unwrap(), Incoming::Heartbeat);
        assert_eq!(Frame::parse("\r\n\n").unwrap(), Incoming::Heartbeat);
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let parsed = frame("SEND\ndestination:/topic/a\ndestination:/topic/b\n\n\0");
        assert_eq!(parsed.destination(), Some("/topic/a"));
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let parsed = frame("SEND\ndestination:/topic/a\ncontent-length:3\n\na\0b\0");
        assert_eq!(parsed.body, "a\0b");
    }

    #[test]
    fn test_content_length_too_long() {
        let result = Frame::parse("SEND\ncontent-length:50\n\nshort\0");
        assert!(matches!(result, Err(GatewayError::FrameParse(_))));
    }

    #[test]
    fn test_header_unescaping() {
        let parsed = frame("SEND\ndestination:/topic/a\nnote:a\\cb\\nc\\\\d\n\n\0");
        assert_eq!(parsed.header("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn test_connect_headers_not_unescaped() {
        let parsed = frame("CONNECT\nlogin:a\\cb\n\n\0");
        assert_eq!(parsed.header("login"), Some("a\\cb"));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(Frame::parse("HELLO\n\n\0").is_err());
        assert!(Frame::parse("SEND\ndestination\n\n\0").is_err());
        assert!(Frame::parse("SEND\ndestination:/x").is_err());
        assert!(Frame::parse("SEND\nx:\\q\n\n\0").is_err());
        assert!(Frame::parse("SEND\n\nbody\0garbage").is_err());
    }

    #[test]
    fn test_encode_message_frame() {
        let encoded = Frame::message("/topic/orders", "sub-0", "m-1", "Table 5: Pizza").encode();
        assert!(encoded.starts_with("MESSAGE\ndestination:/topic/orders\nsubscription:sub-0\n"));
        assert!(encoded.contains("content-length:14\n"));
        assert!(encoded.ends_with("\n\nTable 5: Pizza\0"));
    }

    #[test]
    fn test_encode_escapes_header_values() {
        let encoded = Frame::error("bad: frame", "").encode();
        assert!(encoded.contains("message:bad\\c frame\n"));
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let client = HeartBeat::parse("10000,10000").unwrap();
        let server = HeartBeat::negotiate(client, Duration::from_secs(20));
        assert_eq!(server, HeartBeat { outgoing_ms: 20000, incoming_ms: 20000 });

        let silent = HeartBeat::negotiate(HeartBeat::parse("0,0").unwrap(), Duration::from_secs(5));
        assert_eq!(silent.outgoing_interval(), None);
        assert_eq!(silent.incoming_interval(), None);
        assert_eq!(server.incoming_interval(), Some(Duration::from_secs(20)));
        assert_eq!(silent.to_string(), "0,0");

        assert!(HeartBeat::parse("10000").is_err());
        assert!(HeartBeat::parse("a,b").is_err());
    }
}
