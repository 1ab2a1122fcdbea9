//! Minimal ICAP RESPMOD client: submit one payload, read the verdict.

use exporter_core::Endpoint;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub mod collector;
pub mod response;

pub use collector::{IcapCollector, IcapReading};
pub use response::{IcapParser, IcapResponse};

const USER_AGENT: &str = "clamav-exporter";

#[derive(Debug, Error)]
pub enum IcapError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("partial write of request: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },
}

/// A RESPMOD exchange that failed part-way, with the time spent before it gave up.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct Aborted {
    pub source: IcapError,
    pub elapsed: Duration,
}

/// A completed RESPMOD round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub response: IcapResponse,
    /// From just before connecting to just after parsing the response.
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    service: String,
    parser: IcapParser,
}

impl Client {
    pub fn new(endpoint: Endpoint, service: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Client { endpoint, service: service.into(), parser: IcapParser::new()? })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send `payload` as the body of a RESPMOD request and interpret the reply.
    ///
    /// The clock starts just before dialing, so a failed exchange still reports how long
    /// it took to fail.
    pub async fn respmod(&self, payload: &[u8]) -> Result<Exchange, Aborted> {
        let request = build_respmod(self.endpoint.address(), &self.service, payload);
        let started = Instant::now();
        match self.exchange(&request).await {
            Ok(raw) => {
                let response = self.parser.parse(&raw);
                let elapsed = started.elapsed();
                debug!(endpoint = %self.endpoint, code = ?response.code, detected = response.detected(), "icap responded");
                Ok(Exchange { response, elapsed })
            }
            Err(source) => Err(Aborted { source, elapsed: started.elapsed() }),
        }
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, IcapError> {
        let mut conn = self.endpoint.dial().await?;
        let written = conn.send(request).await?;
        if written != request.len() {
            return Err(IcapError::PartialWrite { written, expected: request.len() });
        }
        conn.close_write().await?;
        Ok(conn.read_to_close().await?)
    }
}

/// Lay out a RESPMOD request carrying `payload` as a single chunk of an encapsulated
/// HTTP response.
pub fn build_respmod(authority: &str, service: &str, payload: &[u8]) -> Vec<u8> {
    let http_header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut req = Vec::with_capacity(256 + http_header.len() + payload.len());
    req.extend_from_slice(format!("RESPMOD icap://{}/{} ICAP/1.0\r\n", authority, service).as_bytes());
    req.extend_from_slice(format!("Host: {}\r\n", authority).as_bytes());
    req.extend_from_slice(format!("User-Agent: {}\r\n", USER_AGENT).as_bytes());
    // RFC 3507 4.6: lets the server answer 204 instead of echoing the body
    req.extend_from_slice(b"Allow: 204\r\n");
    req.extend_from_slice(format!("Encapsulated: res-hdr=0, res-body={}\r\n", http_header.len()).as_bytes());
    req.extend_from_slice(b"\r\n");
    req.extend_from_slice(http_header.as_bytes());
    req.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    req.extend_from_slice(payload);
    req.extend_from_slice(b"\r\n");
    req.extend_from_slice(b"0; ieof\r\n\r\n");
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn request_layout() {
        let req = build_respmod("localhost:1344", "avscan", b"hello");
        let text = String::from_utf8(req).unwrap();
        assert_eq!(
            text,
            "RESPMOD icap://localhost:1344/avscan ICAP/1.0\r\n\
             Host: localhost:1344\r\n\
             User-Agent: clamav-exporter\r\n\
             Allow: 204\r\n\
             Encapsulated: res-hdr=0, res-body=21\r\n\
             \r\n\
             Content-Length: 5\r\n\r\n\
             5\r\nhello\r\n\
             0; ieof\r\n\r\n"
        );
    }

    #[test]
    fn chunk_length_is_hex() {
        let payload = vec![b'x'; 68];
        let req = String::from_utf8(build_respmod("h:1", "s", &payload)).unwrap();
        assert!(req.contains("Content-Length: 68\r\n\r\n44\r\n"));
    }

    #[tokio::test]
    async fn respmod_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut got = Vec::new();
            // the client half-closes once the request is written
            sock.read_to_end(&mut got).await.unwrap();
            sock.write_all(b"ICAP/1.0 200 OK\r\nServer: C-ICAP/0.5.10\r\nX-Infection-Found: Type=0; Resolution=2; Threat=Eicar-Test-Signature;\r\n\r\n")
                .await
                .unwrap();
            got
        });

        let client = Client::new(Endpoint::tcp("127.0.0.1", port), "avscan").unwrap();
        let ex = client.respmod(b"payload").await.unwrap();
        assert_eq!(ex.response.code, Some(200));
        assert_eq!(ex.response.server_version, "0.5.10");
        assert!(ex.response.detected());

        let got = server.await.unwrap();
        assert_eq!(got, build_respmod(&format!("127.0.0.1:{}", port), "avscan", b"payload"));
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = Client::new(Endpoint::tcp("127.0.0.1", port), "avscan").unwrap();
        match client.respmod(b"x").await {
            Err(Aborted { source: IcapError::Io(_), elapsed }) => assert!(elapsed < std::time::Duration::from_secs(2)),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
