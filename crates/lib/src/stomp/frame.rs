use std::fmt;

/// STOMP commands used by the chat protocol (client and server side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT/STOMP/CONNECTED carry raw header values; every other frame escapes them.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown stomp command: {0}")]
    UnknownCommand(String),
    #[error("frame is not NUL-terminated")]
    Incomplete,
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid header escape in: {0}")]
    InvalidEscape(String),
    #[error("bad content-length: {0}")]
    BadContentLength(String),
}

/// A single STOMP frame. Headers keep wire order; lookups return the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
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

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to wire text, adding `content-length` for non-empty bodies.
    pub fn encode(&self) -> String {
        let escaped = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if escaped {
                out.push_str(&escape(k));
                out.push(':');
                out.push_str(&escape(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode every frame in a text payload, skipping heart-beat EOLs between frames.
    pub fn decode_all(input: &str) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = input;
        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                break;
            }
            let (frame, after) = decode_one(rest)?;
            frames.push(frame);
            rest = after;
        }
        Ok(frames)
    }
}

/// Split off one line (LF or CRLF terminated).
fn split_line(s: &str) -> Option<(&str, &str)> {
    let i = s.find('\n')?;
    let line = &s[..i];
    Some((line.strip_suffix('\r').unwrap_or(line), &s[i + 1..]))
}

fn decode_one(input: &str) -> Result<(Frame, &str), FrameError> {
    let (command_line, mut rest) = split_line(input).ok_or(FrameError::Incomplete)?;
    let command = Command::parse(command_line)?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, after) = split_line(rest).ok_or(FrameError::Incomplete)?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape(k)?, unescape(v)?));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| FrameError::BadContentLength(v.clone()))
        })
        .transpose()?;

    let (body, after) = match content_length {
        Some(n) => {
            let body = rest
                .get(..n)
                .ok_or_else(|| FrameError::BadContentLength(n.to_string()))?;
            let after = rest[n..].strip_prefix('\0').ok_or(FrameError::Incomplete)?;
            (body, after)
        }
        None => {
            let i = rest.find('\0').ok_or(FrameError::Incomplete)?;
            (&rest[..i], &rest[i + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        after,
    ))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
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
            _ => return Err(FrameError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}
