//! Client for the clamd command protocol over TCP or a local socket.
//!
//! Every call dials a fresh connection, writes one `n`-prefixed command line, and reads
//! newline-terminated responses until clamd closes the connection.

use exporter_core::{Connection, Endpoint};
use std::io;
use thiserror::Error;
use tracing::debug;

pub mod collector;
pub mod response;
pub mod stats;

pub use collector::ClamdCollector;
pub use exporter_core::EICAR;
pub use response::{CommandResult, ResponseParser, Status};
pub use stats::{DaemonStats, StatsParser, StatsReport, VersionInfo, VersionParseError, VersionParser};

/// Largest chunk clamd accepts in a single `INSTREAM` write from this client.
pub const MAX_CHUNK_SIZE: usize = 1024;

/// Selects clamd's newline-delimited command mode.
const COMMAND_MARKER: u8 = b'n';

#[derive(Debug, Error)]
pub enum ClamdError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },
    #[error("chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: usize, max: usize },
    #[error("no response from clamd")]
    NoResponse,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    parser: ResponseParser,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Result<Self, regex::Error> {
        Ok(Client { endpoint, parser: ResponseParser::new()? })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run a single command and parse every line clamd sends back.
    pub async fn run_command(&self, cmd: &str) -> Result<Vec<CommandResult>, ClamdError> {
        let mut conn = self.endpoint.dial().await?;
        write_command(&mut conn, cmd).await?;
        self.responses(&mut conn).await
    }

    /// Run a command whose only acceptable answer is the single line `expected`.
    pub async fn run_command_expect(&self, cmd: &str, expected: &str) -> Result<(), ClamdError> {
        let results = self.run_command(cmd).await?;
        match results.as_slice() {
            [] => Err(ClamdError::NoResponse),
            [r] if r.raw == expected => Ok(()),
            lines => {
                let raw: Vec<&str> = lines.iter().map(|r| r.raw.as_str()).collect();
                Err(ClamdError::UnexpectedResponse(raw.join("\n")))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), ClamdError> {
        self.run_command_expect("PING", "PONG").await
    }

    pub async fn version(&self) -> Result<String, ClamdError> {
        let results = self.run_command("VERSION").await?;
        results.into_iter().next().map(|r| r.raw).ok_or(ClamdError::NoResponse)
    }

    pub async fn stats(&self) -> Result<StatsReport, ClamdError> {
        let results = self.run_command("STATS").await?;
        Ok(StatsReport::from_lines(results.iter().map(|r| r.raw.as_str())))
    }

    /// Scan `payload` as a single `INSTREAM` chunk. Payloads above [`MAX_CHUNK_SIZE`] are
    /// rejected before anything is dialed.
    pub async fn submit_stream(&self, payload: &[u8]) -> Result<Vec<CommandResult>, ClamdError> {
        check_chunk(payload)?;
        let mut stream = self.in_stream().await?;
        stream.write_chunk(payload).await?;
        stream.finish().await
    }

    /// Open an `INSTREAM` session for callers that split larger payloads into chunks.
    pub async fn in_stream(&self) -> Result<InStream<'_>, ClamdError> {
        let mut conn = self.endpoint.dial().await?;
        write_command(&mut conn, "INSTREAM").await?;
        Ok(InStream { conn, parser: &self.parser })
    }

    async fn responses(&self, conn: &mut Connection) -> Result<Vec<CommandResult>, ClamdError> {
        let raw = conn.read_to_close().await?;
        let results = split_lines(&raw).map(|line| self.parser.parse(&line)).collect::<Vec<_>>();
        debug!(endpoint = %self.endpoint, lines = results.len(), "clamd responded");
        Ok(results)
    }
}

/// A running `INSTREAM` submission. Dropping it without [`InStream::finish`] abandons the scan.
pub struct InStream<'a> {
    conn: Connection,
    parser: &'a ResponseParser,
}

impl InStream<'_> {
    /// Write one length-prefixed chunk. Oversized chunks fail without writing anything.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), ClamdError> {
        check_chunk(data)?;
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);
        send_exact(&mut self.conn, &frame).await
    }

    /// Terminate the stream with a zero-length chunk and collect the verdict.
    pub async fn finish(mut self) -> Result<Vec<CommandResult>, ClamdError> {
        send_exact(&mut self.conn, &0u32.to_be_bytes()).await?;
        let raw = self.conn.read_to_close().await?;
        Ok(split_lines(&raw).map(|line| self.parser.parse(&line)).collect())
    }
}

fn check_chunk(data: &[u8]) -> Result<(), ClamdError> {
    if data.len() > MAX_CHUNK_SIZE {
        return Err(ClamdError::ChunkTooLarge { size: data.len(), max: MAX_CHUNK_SIZE });
    }
    Ok(())
}

async fn write_command(conn: &mut Connection, cmd: &str) -> Result<(), ClamdError> {
    let mut line = Vec::with_capacity(cmd.len() + 2);
    line.push(COMMAND_MARKER);
    line.extend_from_slice(cmd.as_bytes());
    line.push(b'\n');
    send_exact(conn, &line).await
}

async fn send_exact(conn: &mut Connection, buf: &[u8]) -> Result<(), ClamdError> {
    let written = conn.send(buf).await?;
    if written != buf.len() {
        return Err(ClamdError::PartialWrite { written, expected: buf.len() });
    }
    Ok(())
}

/// Split a response into lines, trimming trailing whitespace. A final line without a
/// terminating newline is kept if it has content.
fn split_lines(raw: &[u8]) -> impl Iterator<Item = String> + '_ {
    let mut parts: Vec<&[u8]> = raw.split(|b| *b == b'\n').collect();
    if parts.last().is_some_and(|p| p.iter().all(u8::is_ascii_whitespace)) {
        parts.pop();
    }
    parts.into_iter().map(|p| String::from_utf8_lossy(p).trim_end().to_string())
}
