//! Line protocol codec.
//!
//! Parses request lines and status lines, and serializes requests and
//! responses:
//! - Request: `GET <path> HTTP/1.1`, then `Host: <host>` and
//!   `Connection: Keep-Alive`
//! - Success: `HTTP/1.1 200 OK`, `Content-Type: <type>`, a blank line, the body
//! - Failure: `HTTP/1.1 <code> <message>` with no body

use bytes::BytesMut;
use std::fmt;

/// The only supported method
pub const METHOD: &str = "GET";

/// Scheme prefix of the version token
pub const SCHEME: &str = "HTTP/";

/// The only supported protocol version
pub const VERSION: &str = "1.1";

pub const OK: u16 = 200;
pub const NOT_FOUND: u16 = 404;
pub const INTERNAL_SERVER_ERROR: u16 = 500;

/// Content type attached to every served file
pub const TEXT_PLAIN: &str = "text/plain";

const CRLF: &[u8] = b"\r\n";

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Request line missing or blank
    EmptyRequest,
    /// First token is not `GET`
    UnsupportedMethod(String),
    /// Last token does not start with `HTTP/`
    UnsupportedScheme(String),
    /// Version suffix is not `1.1`
    UnsupportedVersion(String),
    /// Status line too short or with a non-numeric code
    MalformedStatusLine(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EmptyRequest => write!(f, "Invalid empty request"),
            ParseError::UnsupportedMethod(method) => write!(f, "Unknown method: {}", method),
            ParseError::UnsupportedScheme(scheme) => write!(f, "Unknown scheme: {}", scheme),
            ParseError::UnsupportedVersion(version) => {
                write!(f, "Unknown HTTP version: {}", version)
            }
            ParseError::MalformedStatusLine(line) => write!(f, "Malformed status line: {}", line),
        }
    }
}

impl std::error::Error for ParseError {}

/// A decoded request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
}

impl Request {
    /// Parse a request line.
    ///
    /// Method and version are validated before the path is extracted. The
    /// path is every token between them, rejoined with single spaces.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (Some(&method), Some(&version_token)) = (tokens.first(), tokens.last()) else {
            return Err(ParseError::EmptyRequest);
        };

        if !method.eq_ignore_ascii_case(METHOD) {
            return Err(ParseError::UnsupportedMethod(method.to_string()));
        }

        match version_token.get(..SCHEME.len()) {
            Some(scheme) if scheme.eq_ignore_ascii_case(SCHEME) => {}
            _ => return Err(ParseError::UnsupportedScheme(version_token.to_string())),
        }
        // The scheme matches in any case, but the version is only split off
        // an upper-case `HTTP/`; `http/1.1` is an unknown version.
        let version = version_token.strip_prefix(SCHEME).unwrap_or(version_token);
        if version != VERSION {
            return Err(ParseError::UnsupportedVersion(version.to_string()));
        }

        let path = if tokens.len() > 2 {
            tokens[1..tokens.len() - 1].join(" ")
        } else {
            String::new()
        };

        Ok(Request {
            method: method.to_string(),
            path,
            version: version.to_string(),
        })
    }

    /// Serialize a request for `path` addressed to `host`
    pub fn encode(path: &str, host: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64 + path.len() + host.len());
        buf.extend_from_slice(format!("{METHOD} {path} {SCHEME}{VERSION}").as_bytes());
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(format!("Host: {host}").as_bytes());
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(b"Connection: Keep-Alive");
        buf.extend_from_slice(CRLF);
        buf
    }
}

/// Exactly one of these is produced per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success { content_type: String, body: String },
    Failure { code: u16, message: String },
}

impl Response {
    /// A `200 OK` carrying plain text
    pub fn text(body: String) -> Self {
        Response::Success {
            content_type: TEXT_PLAIN.to_string(),
            body,
        }
    }

    pub fn not_found() -> Self {
        Response::Failure {
            code: NOT_FOUND,
            message: "Not Found".to_string(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Response::Success { .. } => OK,
            Response::Failure { code, .. } => *code,
        }
    }

    /// Serialize to wire format. The body is written verbatim, with no
    /// trailing line terminator added.
    pub fn encode(&self) -> BytesMut {
        match self {
            Response::Success { content_type, body } => {
                let mut buf = BytesMut::with_capacity(64 + body.len());
                buf.extend_from_slice(format!("{SCHEME}{VERSION} {OK} OK").as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(format!("Content-Type: {content_type}").as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(body.as_bytes());
                buf
            }
            Response::Failure { code, message } => {
                let mut buf = BytesMut::with_capacity(32 + message.len());
                buf.extend_from_slice(format!("{SCHEME}{VERSION} {code} {message}").as_bytes());
                buf.extend_from_slice(CRLF);
                buf
            }
        }
    }
}

/// A parsed response status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub message: String,
}

impl StatusLine {
    /// Token 1 is the code, tokens 2.. joined with spaces are the message
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(ParseError::MalformedStatusLine(line.trim_end().to_string()));
        }

        let code = tokens[1]
            .parse::<u16>()
            .map_err(|_| ParseError::MalformedStatusLine(line.trim_end().to_string()))?;

        Ok(StatusLine {
            code,
            message: tokens[2..].join(" "),
        })
    }
}
