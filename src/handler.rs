//! Per-connection request handling.
//!
//! One handler task owns its connection end to end: read the request line,
//! resolve the path, write exactly one response, wait out the grace period,
//! close. Every failure is converted to a failure response at this boundary.

use crate::protocol::{ParseError, Request, Response, INTERNAL_SERVER_ERROR, NOT_FOUND};
use crate::resolver::{FileResolver, Resolution};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Longest request line accepted before it is cut off
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Bytes kept from the end of an over-long request line
const TAIL_LENGTH: usize = 256;

/// Failures raised while handling one request
#[derive(Debug)]
pub enum RequestError {
    /// Socket already closed before handling started
    ConnectionClosed,
    /// Request line missing or invalid
    Parse(ParseError),
    /// Path does not name a regular, readable file
    FileNotFound(String),
    /// Anything unexpected
    Internal(io::Error),
}

impl RequestError {
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::FileNotFound(_) => NOT_FOUND,
            _ => INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_response(&self) -> Response {
        match self {
            RequestError::FileNotFound(_) => Response::not_found(),
            other => Response::Failure {
                code: other.status_code(),
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ConnectionClosed => write!(f, "Connection already closed"),
            RequestError::Parse(e) => write!(f, "{}", e),
            RequestError::FileNotFound(path) => write!(f, "File not found: {}", path),
            RequestError::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Parse(e) => Some(e),
            RequestError::Internal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for RequestError {
    fn from(e: ParseError) -> Self {
        RequestError::Parse(e)
    }
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Internal(e)
    }
}

/// Serves one request per connection
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    resolver: FileResolver,
    grace_period: Duration,
}

impl ConnectionHandler {
    pub fn new(resolver: FileResolver, grace_period: Duration) -> Self {
        Self {
            resolver,
            grace_period,
        }
    }

    /// Handle an accepted TCP connection and return the status code sent.
    ///
    /// Fails with `ConnectionClosed`, without responding, if the socket is
    /// no longer connected.
    pub async fn handle(&self, stream: TcpStream) -> Result<u16, RequestError> {
        stream
            .peer_addr()
            .map_err(|_| RequestError::ConnectionClosed)?;

        let (reader, writer) = stream.into_split();
        let code = self.serve(BufReader::new(reader), writer).await?;
        Ok(code)
    }

    /// Read one request from `reader`, write its response to `writer`,
    /// then close `writer` after the grace period.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> io::Result<u16>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let response = match self.respond(&mut reader).await {
            Ok(response) => response,
            Err(e @ RequestError::FileNotFound(_)) => {
                debug!(error = %e, "Responding not found");
                e.to_response()
            }
            Err(e) => {
                warn!(error = %e, "Request failed");
                e.to_response()
            }
        };

        writer.write_all(&response.encode()).await?;
        writer.flush().await?;

        if !self.grace_period.is_zero() {
            tokio::time::sleep(self.grace_period).await;
        }

        if let Err(e) = writer.shutdown().await {
            trace!(error = %e, "Shutdown after response failed");
        }

        Ok(response.status_code())
    }

    async fn respond<R>(&self, reader: &mut R) -> Result<Response, RequestError>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = match read_request_line(reader).await? {
            RequestLine::Empty => return Err(ParseError::EmptyRequest.into()),
            RequestLine::Complete(line) => line,
            RequestLine::Oversized { head, tail } => return Err(reject_oversized(&head, &tail)),
        };

        let request = Request::parse(&line)?;
        debug!(
            method = %request.method,
            path = %request.path,
            version = %request.version,
            "Request received"
        );

        match self.resolver.resolve(&request.path).await? {
            Resolution::Found(body) => Ok(Response::text(body)),
            Resolution::NotFound => Err(RequestError::FileNotFound(request.path)),
        }
    }
}

/// First line of a request as read off the wire
#[derive(Debug, PartialEq, Eq)]
enum RequestLine {
    /// Peer closed before sending anything
    Empty,
    Complete(String),
    /// Longer than `MAX_LINE_LENGTH`: its first bytes and its last bytes
    Oversized { head: String, tail: String },
}

async fn read_request_line<R>(reader: &mut R) -> io::Result<RequestLine>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut head)
        .await?;

    if n == 0 {
        return Ok(RequestLine::Empty);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    if n < MAX_LINE_LENGTH || head.ends_with('\n') {
        return Ok(RequestLine::Complete(head));
    }

    let tail = drain_line(reader).await?;
    trace!(tail_len = tail.len(), "Request line over limit, rest discarded");
    Ok(RequestLine::Oversized {
        head,
        tail: String::from_utf8_lossy(&tail).into_owned(),
    })
}

/// Consume the rest of a line without buffering it, keeping only its last
/// `TAIL_LENGTH` bytes
async fn drain_line<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut tail = Vec::with_capacity(TAIL_LENGTH * 2);
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            break;
        }

        let (used, done) = match buf.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (buf.len(), false),
        };
        tail.extend_from_slice(&buf[..used]);
        reader.consume(used);

        if tail.len() > TAIL_LENGTH {
            tail.drain(..tail.len() - TAIL_LENGTH);
        }
        if done {
            break;
        }
    }
    Ok(tail)
}

/// Validate an over-long request line from its ends.
///
/// Method and version are checked as for any request. The path cannot
/// name a file, so a well-formed line is answered as not found without
/// touching the filesystem.
fn reject_oversized(head: &str, tail: &str) -> RequestError {
    let mut tokens = head.split_whitespace();
    let method = tokens.next().unwrap_or_default();
    let version = tail
        .split_whitespace()
        .last()
        .or_else(|| head.split_whitespace().last())
        .unwrap_or_default();

    match Request::parse(&format!("{method} {version}")) {
        Ok(_) => RequestError::FileNotFound(tokens.collect::<Vec<_>>().join(" ")),
        Err(e) => e.into(),
    }
}
