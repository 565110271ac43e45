//! Client side of the line protocol.
//!
//! A client dials one connection, sends a single request and reads the
//! response to end of stream. Every read carries a deadline; the
//! connection is closed after the request whatever the outcome.

use crate::config::ClientConfig;
use crate::protocol::{ParseError, Request, StatusLine, OK};
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Client-side failures
#[derive(Debug)]
pub enum ClientError {
    /// Socket failure while connecting, writing or reading
    Io(io::Error),
    /// A read exceeded the deadline
    Timeout(Duration),
    /// Unparseable status line
    Protocol(ParseError),
    /// Server closed the connection without a status line
    UnexpectedEof,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Timeout(limit) => {
                write!(f, "Read timed out after {}ms", limit.as_millis())
            }
            ClientError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ClientError::UnexpectedEof => write!(f, "Connection closed before a response"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            ClientError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<ParseError> for ClientError {
    fn from(e: ParseError) -> Self {
        ClientError::Protocol(e)
    }
}

/// Outcome of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `200`: everything after the header separator
    Found { content: String },
    /// Any other status
    Failed { code: u16, message: String },
}

impl Reply {
    pub fn code(&self) -> u16 {
        match self {
            Reply::Found { .. } => OK,
            Reply::Failed { code, .. } => *code,
        }
    }

    /// Write the file content, if any, to stdout
    pub fn print(&self) -> io::Result<()> {
        if let Reply::Found { content } = self {
            let mut stdout = io::stdout().lock();
            stdout.write_all(content.as_bytes())?;
            if !content.is_empty() && !content.ends_with('\n') {
                stdout.write_all(b"\n")?;
            }
            stdout.flush()?;
        }
        Ok(())
    }
}

/// One connection, one request
#[derive(Debug)]
pub struct Client {
    stream: Option<BufReader<TcpStream>>,
    peer: SocketAddr,
    timeout: Duration,
}

impl Client {
    /// Dial `host:port`; reads on the connection time out after `config.timeout`
    pub async fn connect(host: &str, port: u16, config: &ClientConfig) -> Result<Self, ClientError> {
        let stream = TcpStream::connect((host, port)).await?;
        let peer = stream.peer_addr()?;
        debug!(peer = %peer, "Connected to server");

        Ok(Client {
            stream: Some(BufReader::new(stream)),
            peer,
            timeout: config.timeout,
        })
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(peer = %self.peer, "Connection with server closed by client");
        }
    }

    /// Request `path` and read the response.
    ///
    /// Returns `Ok(None)` without sending anything if the connection is
    /// already closed. The connection is closed on return.
    pub async fn request_file(&mut self, path: &str) -> Result<Option<Reply>, ClientError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let result = exchange(stream, self.peer, self.timeout, path).await;
        self.close();

        result.map(Some)
    }
}

async fn exchange(
    stream: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    timeout: Duration,
    path: &str,
) -> Result<Reply, ClientError> {
    let request = Request::encode(path, &peer.ip().to_string());
    stream.get_mut().write_all(&request).await?;

    let mut line = String::new();
    if read_line(stream, timeout, &mut line).await? == 0 {
        return Err(ClientError::UnexpectedEof);
    }

    let status = StatusLine::parse(&line)?;
    if status.code != OK {
        warn!(code = status.code, message = %status.message, path, "Server returned an error");
        return Ok(Reply::Failed {
            code: status.code,
            message: status.message,
        });
    }
    debug!(path, "Received successful response");

    // Headers end at the first blank line
    loop {
        line.clear();
        if read_line(stream, timeout, &mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
    }

    let mut content = String::new();
    loop {
        line.clear();
        if read_line(stream, timeout, &mut line).await? == 0 {
            break;
        }
        content.push_str(&line);
    }

    Ok(Reply::Found { content })
}

async fn read_line(
    stream: &mut BufReader<TcpStream>,
    timeout: Duration,
    buf: &mut String,
) -> Result<usize, ClientError> {
    tokio::time::timeout(timeout, stream.read_line(buf))
        .await
        .map_err(|_| ClientError::Timeout(timeout))?
        .map_err(ClientError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use std::fs;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn client_config() -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(5),
        }
    }

    async fn file_server(root: &std::path::Path) -> Server {
        let server = Server::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            root: root.to_path_buf(),
            grace_period: Duration::from_millis(10),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        server.start().await;
        server
    }

    /// Serve one canned response to whoever connects first
    async fn canned_server(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 256];
            while !request.ends_with(b"Keep-Alive\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(response).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_request_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("poem.txt"), "line one\n\nline three\n").unwrap();
        let server = file_server(dir.path()).await;

        let mut client = Client::connect("127.0.0.1", server.local_addr().port(), &client_config())
            .await
            .unwrap();
        let reply = client.request_file("poem.txt").await.unwrap();
        assert_eq!(
            reply,
            Some(Reply::Found {
                content: "line one\n\nline three\n".to_string()
            })
        );
        assert!(client.is_closed());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_request_file_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        let server = file_server(dir.path()).await;

        let mut client = Client::connect("127.0.0.1", server.local_addr().port(), &client_config())
            .await
            .unwrap();
        let reply = client.request_file("hello.txt").await.unwrap().unwrap();
        assert_eq!(reply, Reply::Found { content: "hi".to_string() });
        assert_eq!(reply.code(), 200);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_request_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = file_server(dir.path()).await;

        let mut client = Client::connect("127.0.0.1", server.local_addr().port(), &client_config())
            .await
            .unwrap();
        let reply = client.request_file("/nope").await.unwrap();
        assert_eq!(
            reply,
            Some(Reply::Failed {
                code: 404,
                message: "Not Found".to_string()
            })
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_clients() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let server = file_server(dir.path()).await;
        let port = server.local_addr().port();

        let mut tasks = Vec::new();
        for i in 0..16 {
            tasks.push(tokio::spawn(async move {
                let mut client = Client::connect("127.0.0.1", port, &client_config())
                    .await
                    .unwrap();
                let path = if i % 4 == 0 { "missing" } else { "a.txt" };
                (i, client.request_file(path).await.unwrap().unwrap())
            }));
        }

        for task in tasks {
            let (i, reply) = task.await.unwrap();
            if i % 4 == 0 {
                assert_eq!(reply.code(), 404);
            } else {
                assert_eq!(reply, Reply::Found { content: "alpha".to_string() });
            }
        }

        assert!(server.shutdown(Duration::from_secs(5)).await);
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_second_request_is_noop() {
        let addr = canned_server(b"HTTP/1.1 404 Not Found\r\n").await;
        let mut client = Client::connect("127.0.0.1", addr.port(), &client_config())
            .await
            .unwrap();

        assert!(client.request_file("/x").await.unwrap().is_some());
        assert!(client.request_file("/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_client_sends_nothing() {
        let addr = canned_server(b"HTTP/1.1 200 OK\r\n\r\nunused").await;
        let mut client = Client::connect("127.0.0.1", addr.port(), &client_config())
            .await
            .unwrap();

        client.close();
        assert!(client.is_closed());
        assert!(client.request_file("/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_status_line() {
        let addr = canned_server(b"garbage\r\n").await;
        let mut client = Client::connect("127.0.0.1", addr.port(), &client_config())
            .await
            .unwrap();

        let result = client.request_file("/x").await;
        assert!(matches!(
            result,
            Err(ClientError::Protocol(ParseError::MalformedStatusLine(_)))
        ));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_eof_before_status_line() {
        let addr = canned_server(b"").await;
        let mut client = Client::connect("127.0.0.1", addr.port(), &client_config())
            .await
            .unwrap();

        let result = client.request_file("/x").await;
        assert!(matches!(result, Err(ClientError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_read_timeout_is_distinct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let config = ClientConfig {
            timeout: Duration::from_millis(50),
        };
        let mut client = Client::connect("127.0.0.1", port, &config).await.unwrap();
        let result = client.request_file("/x").await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert!(client.is_closed());

        silent.abort();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Client::connect("127.0.0.1", port, &client_config()).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
