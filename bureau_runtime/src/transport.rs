//! Framed request/reply transport over TCP.
//!
//! Wire format: one protocol message per frame.
//!   [4-byte LE length][payload][4-byte LE length][payload]...
//!
//! Rules:
//!   - Frames above `MAX_FRAME_LEN` are rejected
//!   - A session listener is bound by linear port probing, no wraparound
//!   - Every send and every receive must finish within the reply timeout,
//!     measured over the whole frame rather than per read or write

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{BridgeError, ProtocolError, Result};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ── Framing ────────────────────────────────────────────────────

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length: {}", len),
        ));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(frame)
}

// ── Deadlines ──────────────────────────────────────────────────

/// A stream view that fails with `TimedOut` once a fixed deadline passes.
///
/// Socket timeouts bound a single read or write. Re-applying the remaining
/// time before each call bounds the whole frame, so a peer that trickles
/// bytes (or stops draining ours) cannot hold the caller past the deadline.
pub(crate) struct DeadlineStream<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
}

impl<'a> DeadlineStream<'a> {
    pub(crate) fn new(stream: &'a TcpStream, timeout: Duration) -> Self {
        Self {
            stream,
            deadline: Instant::now() + timeout,
        }
    }

    fn remaining(&self) -> io::Result<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed"))
    }
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_read_timeout(Some(self.remaining()?))?;
        let mut stream = self.stream;
        stream.read(buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.set_write_timeout(Some(self.remaining()?))?;
        let mut stream = self.stream;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.stream;
        stream.flush()
    }
}

// ── Exchange ───────────────────────────────────────────────────

/// One side of a strict request/reply channel.
pub trait Exchange {
    fn send(&mut self, payload: &[u8]) -> Result<()>;
    fn receive(&mut self) -> Result<Vec<u8>>;
}

/// A connected peer stream. Sends and receives are bounded by the reply
/// timeout.
pub struct TcpChannel {
    stream: TcpStream,
    peer: SocketAddr,
    reply_timeout: Duration,
}

impl TcpChannel {
    pub fn new(stream: TcpStream, reply_timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(reply_timeout))?;
        stream.set_write_timeout(Some(reply_timeout))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            reply_timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn shutdown(&self) {
        // The peer may already be gone; nothing left to report.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Exchange for TcpChannel {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        trace!(peer = %self.peer, len = payload.len(), "send frame");
        let mut io = DeadlineStream::new(&self.stream, self.reply_timeout);
        write_frame(&mut io, payload).map_err(|e| classify_write_error(e, self.reply_timeout))
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let mut io = DeadlineStream::new(&self.stream, self.reply_timeout);
        let frame = read_frame(&mut io).map_err(|e| classify_read_error(e, self.reply_timeout))?;
        trace!(peer = %self.peer, len = frame.len(), "received frame");
        Ok(frame)
    }
}

pub(crate) fn classify_read_error(err: io::Error, timeout: Duration) -> BridgeError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ProtocolError::Timeout(timeout).into()
        }
        io::ErrorKind::InvalidData => ProtocolError::MalformedMessage(err.to_string()).into(),
        _ => BridgeError::Transport(err),
    }
}

pub(crate) fn classify_write_error(err: io::Error, timeout: Duration) -> BridgeError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ProtocolError::Timeout(timeout).into()
        }
        _ => BridgeError::Transport(err),
    }
}

// ── Port probing ───────────────────────────────────────────────

/// Whether a bind failure is specific to the port, so probing may go on.
fn port_unavailable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

/// Try `start..=max` in order and return the first successful bind.
///
/// A port that is in use (or privileged) advances to the next one. Any
/// other failure concerns the host rather than the port and is returned
/// at once. No port is touched after the first success, and the probe
/// never wraps around.
pub fn probe_ports<T, F>(start: u16, max: u16, mut try_bind: F) -> Result<(T, u16)>
where
    F: FnMut(u16) -> io::Result<T>,
{
    for port in start..=max {
        match try_bind(port) {
            Ok(bound) => return Ok((bound, port)),
            Err(e) if port_unavailable(&e) => {
                debug!(port, error = %e, "port unavailable, probing next")
            }
            Err(e) => return Err(BridgeError::Transport(e)),
        }
    }
    Err(BridgeError::ResourceExhausted { start, max })
}

/// Bind a TCP listener on the first free port of `start..=max`.
///
/// The host is resolved once, up front. Returns the listener and the port
/// it actually bound, which differs from the probed one only when probing
/// port 0.
pub fn bind_listener(host: &str, start: u16, max: u16) -> Result<(TcpListener, u16)> {
    let ip = (host, 0)
        .to_socket_addrs()
        .map_err(|e| BridgeError::Config(format!("cannot resolve host {}: {}", host, e)))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| BridgeError::Config(format!("host {} has no address", host)))?;

    let (listener, _) = probe_ports(start, max, |port| {
        TcpListener::bind(SocketAddr::new(ip, port))
    })?;
    let port = listener.local_addr()?.port();
    debug!(host, port, "listener bound");
    Ok((listener, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_are_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").unwrap();
        write_frame(&mut buf, b"").unwrap();
        assert_eq!(&buf[..7], &[3, 0, 0, 0, b'a', b'b', b'c']);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"abc");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
        let eof = read_frame(&mut cursor).unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut cursor = Cursor::new(vec![5, 0, 0, 0, 1, 2]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn oversized_frame_is_invalid_data() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(
            classify_read_error(err, Duration::from_secs(1)),
            BridgeError::Protocol(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn read_timeouts_classify_as_protocol_timeout() {
        let t = Duration::from_millis(5);
        for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::TimedOut] {
            assert!(matches!(
                classify_read_error(io::Error::from(kind), t),
                BridgeError::Protocol(ProtocolError::Timeout(d)) if d == t
            ));
        }
        assert!(matches!(
            classify_read_error(io::Error::from(io::ErrorKind::UnexpectedEof), t),
            BridgeError::Transport(_)
        ));
    }

    #[test]
    fn probe_stops_at_first_free_port() {
        let mut touched = Vec::new();
        let (bound, port) = probe_ports(5555, 5560, |port| {
            touched.push(port);
            if port == 5558 {
                Ok(port)
            } else {
                Err(io::Error::from(io::ErrorKind::AddrInUse))
            }
        })
        .unwrap();
        assert_eq!((bound, port), (5558, 5558));
        assert_eq!(touched, vec![5555, 5556, 5557, 5558]);
    }

    #[test]
    fn probe_exhausts_without_wraparound() {
        let mut touched = Vec::new();
        let err = probe_ports(5555, 65535, |port| {
            touched.push(port);
            Err::<(), _>(io::Error::from(io::ErrorKind::AddrInUse))
        })
        .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ResourceExhausted { start: 5555, max: 65535 }
        ));
        assert_eq!(touched.len(), 65535 - 5555 + 1);
        assert_eq!(touched.first(), Some(&5555));
        assert_eq!(touched.last(), Some(&65535));
        assert!(touched.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn bind_skips_occupied_port() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        if taken_port == u16::MAX {
            return;
        }
        match bind_listener("127.0.0.1", taken_port, u16::MAX) {
            Ok((_listener, port)) => assert!(port > taken_port),
            Err(e) => panic!("no free port above {}: {}", taken_port, e),
        }
    }

    #[test]
    fn probe_stops_on_host_level_failure() {
        let mut touched = Vec::new();
        let err = probe_ports(5555, 5600, |port| {
            touched.push(port);
            Err::<(), _>(io::Error::from(io::ErrorKind::AddrNotAvailable))
        })
        .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(touched, vec![5555]);
    }

    #[test]
    fn foreign_host_address_is_reported_not_probed() {
        // TEST-NET-1, never assigned to a local interface
        let err = bind_listener("192.0.2.1", 5555, 65535).unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)), "{:?}", err);
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn elapsed_deadline_fails_without_blocking() {
        let (server, _client) = loopback_pair();
        let mut io = DeadlineStream::new(&server, Duration::ZERO);
        let err = read_frame(&mut io).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        let err = write_frame(&mut io, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn trickled_frame_misses_the_deadline() {
        let (server, mut client) = loopback_pair();
        let writer = std::thread::spawn(move || {
            for byte in [3u8, 0, 0, 0, b'a', b'b', b'c'] {
                if client.write_all(&[byte]).is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(60));
            }
        });

        let mut channel = TcpChannel::new(server, Duration::from_millis(150)).unwrap();
        let start = Instant::now();
        let err = channel.receive().unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(ProtocolError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_millis(400));
        channel.shutdown();
        writer.join().unwrap();
    }
}
