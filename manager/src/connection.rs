//! Per-worker socket wrapper: incremental line/payload reassembly on top
//! of a non-blocking stream, plus outbound write buffering. Mirrors the
//! original's `link_readline`/`link_read` pair but adapted to
//! single-threaded cooperative polling instead of a blocking read call
//! per message (spec.md §5, "no operation blocks indefinitely").
//!
//! Reads and writes are driven with [`FutureExt::now_or_never`] rather
//! than `TcpStream::try_read`/`try_write`, so the exact same code path
//! handles a plain connection or one wrapped in `tokio_rustls` once TLS
//! admission (spec.md §4.5, `crate::admission`) has completed the
//! handshake — both only need to implement `AsyncRead`/`AsyncWrite`.
//!
//! This module owns no manager state; it only turns bytes into
//! [`ds_protocol::InboundMessage`]s and queues bytes to be written. The
//! event loop (C9) decides what those messages mean.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use ds_protocol::{
    parse_header_line, InboundHeader, InboundMessage, ProtocolError, LINE_MAX,
    MAX_TASK_STDOUT_STORAGE,
};

/// Token-bucket cap on inbound bytes/sec for one connection, backing
/// `DS_BANDWIDTH`/`bandwidth_limit_bps` (spec.md §6). The original
/// blocks the single reader thread to pace a transfer
/// (`ds_set_bandwidth_limit`'s `effective_stoptime`); this non-blocking
/// rewrite instead refuses to read more than the bucket currently holds,
/// so one throttled worker never stalls the cooperative loop for
/// everyone else (spec.md §5, "no operation blocks indefinitely").
struct TokenBucket {
    rate_bps: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_bps: u64) -> Self {
        TokenBucket {
            rate_bps: rate_bps as f64,
            tokens: rate_bps as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill since the last call, then hand out at most `want` bytes'
    /// worth of tokens (never more than the bucket holds).
    fn take(&mut self, want: usize) -> usize {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_bps).min(self.rate_bps.max(1.0));
        let granted = want.min(self.tokens.floor().max(0.0) as usize);
        self.tokens -= granted as f64;
        granted
    }
}

/// The underlying byte stream, plain or TLS-terminated. Both arms only
/// need `AsyncRead + AsyncWrite + Unpin`, which is all [`Connection`]
/// relies on.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Poll one read without blocking. `Ok(None)` means "would block",
    /// matching `TcpStream::try_read`'s contract but over any stream.
    fn try_read_now(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self {
            Stream::Plain(s) => s.read(buf).now_or_never().transpose(),
            Stream::Tls(s) => s.read(buf).now_or_never().transpose(),
        }
    }

    fn try_write_now(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self {
            Stream::Plain(s) => s.write(buf).now_or_never().transpose(),
            Stream::Tls(s) => s.write(buf).now_or_never().transpose(),
        }
    }
}

/// What the connection is currently waiting to assemble.
enum ReadState {
    /// Waiting for a `\n`-terminated header line.
    Header,
    /// Header parsed; `total_remaining` more bytes are still owed by the
    /// wire, of which only `capture_remaining` more will be kept in
    /// `captured` — the rest is drained and discarded. For everything but
    /// a `result` message's stdout these are equal (nothing is dropped);
    /// for stdout larger than [`MAX_TASK_STDOUT_STORAGE`] the capture is
    /// capped there and `truncated_bytes` records how much was dropped,
    /// per spec.md §4.7/§8 (`ds_manager.c`'s `retrieved_output_length`
    /// split in `get_result`).
    Payload {
        header: InboundHeader,
        total_remaining: u64,
        capture_remaining: u64,
        captured: Vec<u8>,
        truncated_bytes: u64,
    },
}

/// Overwrite the tail of a capped stdout capture with a marker noting how
/// much was dropped, matching `get_result`'s `truncate_msg` format
/// (`ds_manager.c:1478`). Leaves the buffer's length unchanged.
fn apply_truncation_marker(buf: &mut [u8], truncated_bytes: u64) {
    let marker = format!(
        "\n>>>>>> STDOUT TRUNCATED AFTER THIS POINT.\n>>>>>> MAXIMUM OF {} BYTES REACHED, {} BYTES TRUNCATED.",
        MAX_TASK_STDOUT_STORAGE, truncated_bytes
    );
    let marker = marker.as_bytes();
    let n = marker.len().min(buf.len());
    let start = buf.len() - n;
    buf[start..].copy_from_slice(&marker[marker.len() - n..]);
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One worker's (or status/http client's) connection, plus the
/// incremental parse state and an outbound byte queue.
pub struct Connection {
    pub addr: SocketAddr,
    stream: Stream,
    inbuf: Vec<u8>,
    read_state: ReadState,
    outbuf: VecDeque<u8>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    bandwidth_limit: Option<TokenBucket>,
}

impl Connection {
    pub fn new(stream: Stream, addr: SocketAddr) -> Self {
        Connection {
            addr,
            stream,
            inbuf: Vec::with_capacity(4096),
            read_state: ReadState::Header,
            outbuf: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
            bandwidth_limit: None,
        }
    }

    /// Cap this connection's inbound byte rate (`DS_BANDWIDTH` /
    /// `bandwidth_limit_bps`, spec.md §6). `None` leaves it unbounded.
    pub fn set_bandwidth_limit(&mut self, bps: Option<u64>) {
        self.bandwidth_limit = bps.map(TokenBucket::new);
    }

    pub fn new_plain(stream: TcpStream, addr: SocketAddr) -> Self {
        Connection::new(Stream::Plain(stream), addr)
    }

    pub fn new_tls(stream: TlsStream<TcpStream>, addr: SocketAddr) -> Self {
        Connection::new(Stream::Tls(Box::new(stream)), addr)
    }

    /// Queue bytes for writing; flushed opportunistically by
    /// [`Connection::pump_write`].
    pub fn enqueue_write(&mut self, bytes: &[u8]) {
        self.outbuf.extend(bytes.iter().copied());
    }

    pub fn has_pending_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Write as many queued bytes as the socket will currently accept
    /// without blocking. Returns bytes written.
    pub fn pump_write(&mut self) -> Result<usize, ConnectionError> {
        let mut total = 0usize;
        loop {
            if self.outbuf.is_empty() {
                break;
            }
            let chunk: Vec<u8> = self.outbuf.iter().copied().take(16 * 1024).collect();
            match self.stream.try_write_now(&chunk)? {
                Some(0) | None => break,
                Some(n) => {
                    self.outbuf.drain(0..n);
                    self.bytes_sent += n as u64;
                    total += n;
                }
            }
        }
        Ok(total)
    }

    /// Attempt one non-blocking read and, if it completes a message,
    /// return it. Returns `Ok(None)` when there's nothing to parse yet
    /// (either no bytes available, or a partial line/payload still
    /// buffered). A zero-length successful read means the peer closed
    /// the connection.
    pub fn try_read_message(&mut self) -> Result<Option<InboundMessage>, ConnectionError> {
        let mut scratch = [0u8; 16 * 1024];
        let cap = match &mut self.bandwidth_limit {
            Some(bucket) => bucket.take(scratch.len()),
            None => scratch.len(),
        };
        if cap == 0 {
            // Bucket is empty this tick: leave any already-buffered bytes
            // to be assembled, but don't pull more off the wire yet.
            return self.try_assemble();
        }
        match self.stream.try_read_now(&mut scratch[..cap])? {
            Some(0) => return Err(ConnectionError::Closed),
            Some(n) => {
                self.bytes_received += n as u64;
                self.inbuf.extend_from_slice(&scratch[..n]);
            }
            None => {}
        }
        self.try_assemble()
    }

    fn try_assemble(&mut self) -> Result<Option<InboundMessage>, ConnectionError> {
        loop {
            match &self.read_state {
                ReadState::Header => {
                    let newline = self.inbuf.iter().position(|&b| b == b'\n');
                    let Some(pos) = newline else {
                        if self.inbuf.len() > LINE_MAX {
                            return Err(ConnectionError::Protocol(ProtocolError::LineTooLong(
                                self.inbuf.len(),
                            )));
                        }
                        return Ok(None);
                    };
                    let line_bytes: Vec<u8> = self.inbuf.drain(0..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes);
                    let header = parse_header_line(line.trim_end_matches(['\r', '\n']))?;
                    let remaining = header.payload_len();
                    if remaining == 0 {
                        return Ok(Some(header.finish(Vec::new())?));
                    }
                    // Only a `result` message's claimed OUTLEN is untrusted
                    // worker input large enough to matter; cap what we'll
                    // actually buffer and drain the rest off the wire.
                    let capture_cap = if matches!(header, InboundHeader::ResultHeader { .. }) {
                        remaining.min(MAX_TASK_STDOUT_STORAGE)
                    } else {
                        remaining
                    };
                    self.read_state = ReadState::Payload {
                        header,
                        total_remaining: remaining,
                        capture_remaining: capture_cap,
                        captured: Vec::with_capacity(capture_cap.min(64 * 1024) as usize),
                        truncated_bytes: remaining - capture_cap,
                    };
                }
                ReadState::Payload { total_remaining, .. } => {
                    if self.inbuf.is_empty() {
                        return Ok(None);
                    }
                    let take = (self.inbuf.len() as u64).min(*total_remaining) as usize;
                    let chunk: Vec<u8> = self.inbuf.drain(0..take).collect();
                    let ReadState::Payload {
                        header,
                        total_remaining,
                        mut capture_remaining,
                        mut captured,
                        truncated_bytes,
                    } = std::mem::replace(&mut self.read_state, ReadState::Header)
                    else {
                        unreachable!()
                    };

                    let keep = (chunk.len() as u64).min(capture_remaining) as usize;
                    captured.extend_from_slice(&chunk[..keep]);
                    capture_remaining -= keep as u64;
                    let still_owed = total_remaining - chunk.len() as u64;

                    if still_owed > 0 {
                        self.read_state = ReadState::Payload {
                            header,
                            total_remaining: still_owed,
                            capture_remaining,
                            captured,
                            truncated_bytes,
                        };
                        return Ok(None);
                    }

                    if truncated_bytes > 0 {
                        apply_truncation_marker(&mut captured, truncated_bytes);
                    }
                    return Ok(Some(header.finish(captured)?));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)
    }

    #[test]
    fn token_bucket_starts_full_then_depletes() {
        let mut bucket = TokenBucket::new(1000);
        assert_eq!(bucket.take(500), 500);
        assert_eq!(bucket.take(600), 500, "only ~500 tokens should remain immediately after");
    }

    #[test]
    fn token_bucket_never_grants_more_than_requested() {
        let mut bucket = TokenBucket::new(10_000_000);
        assert_eq!(bucket.take(100), 100);
    }

    #[test]
    fn truncation_marker_overwrites_tail_without_changing_length() {
        let mut buf = vec![b'x'; 200];
        apply_truncation_marker(&mut buf, 12345);
        assert_eq!(buf.len(), 200);
        let tail = String::from_utf8_lossy(&buf);
        assert!(tail.contains("STDOUT TRUNCATED"));
        assert!(tail.contains("12345 BYTES TRUNCATED"));
        assert!(tail.starts_with('x'), "untouched prefix should survive");
    }

    #[test]
    fn header_only_line_parses_without_waiting_for_payload() {
        let header = parse_header_line("alive").unwrap();
        assert_eq!(header.payload_len(), 0);
    }

    #[tokio::test]
    async fn assembles_message_split_across_reads() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_task = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"resu").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client.write_all(b"lt 0 0 2 100 7\nhi").await.unwrap();
            client
        });
        let (server_stream, peer) = listener.accept().await.unwrap();
        let mut conn = Connection::new_plain(server_stream, peer);

        let mut got = None;
        for _ in 0..50 {
            if let Some(msg) = conn.try_read_message().unwrap() {
                got = Some(msg);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            got,
            Some(InboundMessage::Result {
                status: 0,
                exit_code: 0,
                output_len: 2,
                exec_usec: 100,
                taskid: 7,
                stdout: b"hi".to_vec(),
            })
        );
        client_task.await.unwrap();
    }
}
