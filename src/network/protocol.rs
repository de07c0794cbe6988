//! Line-based ping protocol definitions
//!
//! One exchange per stream: the initiator writes `ping\n`, the responder
//! answers `pong\n` and both sides close. The functions here only need an
//! async byte stream, so they run the same over a libp2p stream or an
//! in-memory pipe.

use futures::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use libp2p::{PeerId, StreamProtocol};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Protocol name for ping streams
pub const PING_PROTOCOL: StreamProtocol = StreamProtocol::new("/tangle/ping/1.0.0");

/// Request line written by the initiator
pub const PING_REQUEST: &[u8] = b"ping\n";

/// Acknowledgment line written by the responder
pub const PING_RESPONSE: &[u8] = b"pong\n";

/// Upper bound on a single protocol line
const MAX_LINE_LEN: u64 = 1024;

#[derive(Error, Debug)]
pub enum PingError {
    #[error("Failed to open ping stream to {peer}: {reason}")]
    Dial { peer: PeerId, reason: String },
    #[error("Failed to read ping request: {0}")]
    Request(io::Error),
    #[error("Failed to answer ping: {0}")]
    Reply(io::Error),
    #[error("Ping response error: {0}")]
    Response(io::Error),
    #[error("Ping handler already registered")]
    AlreadyServing,
}

/// A completed request/response round
#[derive(Debug, Clone)]
pub struct PingExchange {
    /// Request line as sent, without the newline
    pub request: String,
    /// Response line as received, without the newline
    pub response: String,
    /// Time between writing the request and receiving the response
    pub rtt: Duration,
}

/// Serve a single inbound ping on `stream`
///
/// Returns the request line. The stream is closed on success and dropped on
/// failure.
pub async fn respond<S>(mut stream: S) -> Result<String, PingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = read_line(&mut stream).await.map_err(PingError::Request)?;
    if !line.ends_with(b"\n") {
        return Err(PingError::Request(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before a complete request line",
        )));
    }

    stream.write_all(PING_RESPONSE).await.map_err(PingError::Reply)?;
    stream.close().await.map_err(PingError::Reply)?;

    Ok(lossy_line(&line))
}

/// Run the initiator side of a ping over `stream`
///
/// The stream is closed on every path, including errors.
pub async fn exchange<S>(mut stream: S) -> Result<PingExchange, PingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = run_exchange(&mut stream).await;
    if let Err(e) = stream.close().await {
        debug!("Closing ping stream failed: {}", e);
    }
    result
}

async fn run_exchange<S>(stream: &mut S) -> Result<PingExchange, PingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    stream.write_all(PING_REQUEST).await.map_err(PingError::Response)?;
    stream.flush().await.map_err(PingError::Response)?;

    // EOF after some bytes still counts as a response
    let line = read_line(stream).await.map_err(PingError::Response)?;
    if line.is_empty() {
        return Err(PingError::Response(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before any response",
        )));
    }
    let rtt = start.elapsed();

    Ok(PingExchange {
        request: lossy_line(PING_REQUEST),
        response: lossy_line(&line),
        rtt,
    })
}

/// Read raw bytes up to and including the first newline, or until EOF
///
/// Line contents are opaque; they are never required to be UTF-8.
async fn read_line<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream.take(MAX_LINE_LEN));
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    Ok(line)
}

fn lossy_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim_end().to_string()
}
