//! Scheme-qualified daemon endpoints and short-lived connections to them.
//!
//! Every connection is dialed fresh for a single exchange and closed by dropping it.
//! TCP connects are bounded by [`CONNECT_TIMEOUT`]; local sockets are dialed without one.
//! Writes and reads run under [`IO_TIMEOUT`] so a daemon that accepts but never answers
//! cannot hold a scrape forever.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Unix,
}

/// Where a daemon listens: `tcp://host:port` or `unix:///path/to/socket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    address: String,
}

impl Endpoint {
    /// Parse a scheme-qualified address. Anything that is not a `tcp://` or `unix://` URL is
    /// taken verbatim as a local socket path.
    pub fn parse(s: &str) -> Endpoint {
        match Url::parse(s) {
            Ok(url) if url.scheme() == "tcp" => {
                let host = url.host_str().unwrap_or_default();
                let address = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                Endpoint { scheme: Scheme::Tcp, address }
            }
            Ok(url) if url.scheme() == "unix" => Endpoint { scheme: Scheme::Unix, address: socket_path(&url) },
            _ => Endpoint { scheme: Scheme::Unix, address: s.to_string() },
        }
    }

    pub fn tcp(host: &str, port: u16) -> Endpoint {
        let address = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        Endpoint { scheme: Scheme::Tcp, address }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// `host:port` for TCP, the socket path for local sockets.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn dial(&self) -> io::Result<Connection> {
        match self.scheme {
            Scheme::Tcp => {
                let stream = deadline(CONNECT_TIMEOUT, "connect", TcpStream::connect(self.address.as_str())).await?;
                Ok(Connection::Tcp(stream))
            }
            Scheme::Unix => dial_unix(&self.address).await,
        }
    }
}

/// The decoded filesystem path of a `unix://` URL.
fn socket_path(url: &Url) -> String {
    match url.to_file_path() {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(()) => url.path().to_string(),
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Tcp => write!(f, "tcp://{}", self.address),
            Scheme::Unix => write!(f, "unix://{}", self.address),
        }
    }
}

#[cfg(unix)]
async fn dial_unix(path: &str) -> io::Result<Connection> {
    UnixStream::connect(path).await.map(Connection::Unix)
}

#[cfg(not(unix))]
async fn dial_unix(path: &str) -> io::Result<Connection> {
    Err(io::Error::new(io::ErrorKind::Unsupported, format!("local sockets are not supported on this platform: {}", path)))
}

/// Run an I/O future under a deadline, reporting expiry as `TimedOut`.
pub async fn deadline<T, F>(limit: Duration, op: &'static str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out after {:?}", op, limit))),
    }
}

/// An open stream to a daemon over either transport.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    /// Write `buf` and return how many bytes the peer accepted. A short count means the
    /// stream stopped taking bytes; callers decide whether that is fatal.
    pub async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        deadline(IO_TIMEOUT, "write", async {
            let mut written = 0;
            while written < buf.len() {
                let n = self.write(&buf[written..]).await?;
                if n == 0 {
                    break;
                }
                written += n;
            }
            self.flush().await?;
            Ok(written)
        })
        .await
    }

    /// Signal end of input to the peer by shutting down the write half.
    pub async fn close_write(&mut self) -> io::Result<()> {
        deadline(IO_TIMEOUT, "shutdown", self.shutdown()).await
    }

    /// Read everything the peer sends until it closes its side.
    pub async fn read_to_close(&mut self) -> io::Result<Vec<u8>> {
        deadline(IO_TIMEOUT, "read", async {
            let mut buf = Vec::new();
            self.read_to_end(&mut buf).await?;
            Ok(buf)
        })
        .await
    }
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
