//! Agent sessions — one bound listener, one peer, one request at a time.
//!
//! Lifecycle:
//!   1. `Session::bind` probes for a free port and binds the listener
//!   2. The acceptor thread waits for an agent and reads its handshake
//!      frame; any non-empty content marks the session ready, once
//!   3. Callers take the session lock for a full request/reply exchange
//!   4. `close` (or a failed exchange) tears the channel down for good
//!
//! Concurrency: the channel sits behind a Mutex held for a whole
//! invocation, so two callers never interleave on the wire.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ProtocolError, Result};
use crate::registry::SessionId;
use crate::transport::{bind_listener, read_frame, DeadlineStream, Exchange, TcpChannel};

// ── Readiness ──────────────────────────────────────────────────

/// One-shot event. Once set it stays set and waiters never block again.
#[derive(Debug, Default)]
pub struct ReadySignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns `true` only for the call that set it.
    pub fn set(&self) -> bool {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        if *set {
            return false;
        }
        *set = true;
        self.cond.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait(&self) {
        let set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let _set = self
            .cond
            .wait_while(set, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Wait at most `timeout`. Returns whether the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let (set, _) = self
            .cond
            .wait_timeout_while(set, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *set
    }
}

// ── Session ────────────────────────────────────────────────────

/// A bound endpoint brokering exactly one agent connection.
pub struct Session {
    id: SessionId,
    port: u16,
    listener: TcpListener,
    ready: ReadySignal,
    channel: Mutex<Option<TcpChannel>>,
    /// Clone of the agent stream, used to interrupt a blocked exchange.
    interrupt: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
    reply_timeout: Duration,
}

impl Session {
    /// Bind a listener on the first free port of the configured range.
    ///
    /// The session carries no id until a registry adopts it.
    pub fn bind(config: &BridgeConfig) -> Result<Self> {
        let (listener, port) = bind_listener(&config.host, config.start_port, config.max_port)?;
        info!(host = %config.host, port, "session bound");
        Ok(Self {
            id: SessionId::UNASSIGNED,
            port,
            listener,
            ready: ReadySignal::new(),
            channel: Mutex::new(None),
            interrupt: Mutex::new(None),
            closed: AtomicBool::new(false),
            reply_timeout: config.reply_timeout(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: SessionId) {
        self.id = id;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start the acceptor thread. It exits once an agent has connected
    /// or the session is closed.
    pub fn spawn_acceptor(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let session = Arc::clone(self);
        thread::Builder::new()
            .name(format!("bureau-accept-{}", self.id))
            .spawn(move || session.accept_agent())
    }

    fn accept_agent(&self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    if !self.is_closed() {
                        warn!(session = %self.id, error = %e, "accept failed, acceptor stopping");
                    }
                    return;
                }
            };
            if self.is_closed() {
                return;
            }

            match self.read_handshake(&stream) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(session = %self.id, %peer, "empty handshake, dropping peer");
                    continue;
                }
                Err(e) => {
                    warn!(session = %self.id, %peer, error = %e, "handshake failed, dropping peer");
                    continue;
                }
            }

            match self.install(stream) {
                Ok(true) => info!(session = %self.id, %peer, "agent connected"),
                Ok(false) => debug!(session = %self.id, %peer, "session closed during handshake"),
                Err(e) => {
                    warn!(session = %self.id, %peer, error = %e, "could not configure agent stream");
                    continue;
                }
            }
            return;
        }
    }

    fn read_handshake(&self, stream: &TcpStream) -> io::Result<bool> {
        let ping = read_frame(&mut DeadlineStream::new(stream, self.reply_timeout))?;
        debug!(session = %self.id, len = ping.len(), "handshake received");
        Ok(!ping.is_empty())
    }

    /// Hand the agent stream to the session. Returns `false`, dropping the
    /// peer, when the session was closed while the handshake was read.
    fn install(&self, stream: TcpStream) -> io::Result<bool> {
        let interrupt = stream.try_clone()?;
        let channel = TcpChannel::new(stream, self.reply_timeout)?;
        {
            // Lock order matches `SessionGuard::poison`: channel, then interrupt.
            // `close` marks the session before taking the interrupt, so
            // either the check below sees it or `close` finds our stream.
            let mut slot = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
            let mut interrupt_slot = self.interrupt.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                channel.shutdown();
                return Ok(false);
            }
            *slot = Some(channel);
            *interrupt_slot = Some(interrupt);
        }
        self.ready.set();
        Ok(true)
    }

    /// Block until an agent has connected, or fail after `timeout`.
    pub fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => self.ready.wait(),
            Some(t) => {
                if !self.ready.wait_timeout(t) {
                    return Err(ProtocolError::Timeout(t).into());
                }
            }
        }
        if self.is_closed() {
            return Err(BridgeError::SessionClosed(self.id));
        }
        Ok(())
    }

    /// Take exclusive use of the agent channel for one full exchange.
    pub fn lock(&self) -> Result<SessionGuard<'_>> {
        let channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() || channel.is_none() {
            return Err(BridgeError::SessionClosed(self.id));
        }
        Ok(SessionGuard {
            session: self,
            channel,
        })
    }

    /// Close the session. Interrupts any exchange in flight, releases
    /// readiness waiters and stops the acceptor.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stream) = self
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        // Still unset means no agent yet: the acceptor is parked in accept().
        if self.ready.set() {
            self.wake_acceptor();
        }
        info!(session = %self.id, "session closed");
    }

    fn wake_acceptor(&self) {
        let Ok(mut addr) = self.listener.local_addr() else {
            return;
        };
        if addr.ip().is_unspecified() {
            let loopback = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }
        let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(200));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(channel) = self
            .channel
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            channel.shutdown();
        }
    }
}

/// Exclusive handle on a session's agent channel.
pub struct SessionGuard<'a> {
    session: &'a Session,
    channel: MutexGuard<'a, Option<TcpChannel>>,
}

impl SessionGuard<'_> {
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    /// Drop the channel after a failed exchange; the session stays closed.
    pub fn poison(mut self) {
        self.session.closed.store(true, Ordering::Release);
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
        self.session
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        warn!(session = %self.session.id, "session poisoned by failed exchange");
    }

    fn channel(&mut self) -> Result<&mut TcpChannel> {
        let id = self.session.id;
        self.channel.as_mut().ok_or(BridgeError::SessionClosed(id))
    }
}

impl Exchange for SessionGuard<'_> {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.channel()?.send(payload)
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        self.channel()?.receive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn signal_sets_once() {
        let signal = ReadySignal::new();
        assert!(!signal.is_set());
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());
        signal.wait();
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wait_timeout_expires_when_unset() {
        let signal = ReadySignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn waiters_wake_on_set() {
        let signal = Arc::new(ReadySignal::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let s = Arc::clone(&signal);
                thread::spawn(move || s.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        signal.set();
        for w in waiters {
            w.join().unwrap();
        }
    }

    fn loopback_config() -> BridgeConfig {
        BridgeConfig::default()
            .with_port_range(0, 0)
            .with_reply_timeout(Duration::from_millis(500))
    }

    #[test]
    fn lock_before_agent_is_closed_error() {
        let session = Session::bind(&loopback_config()).unwrap();
        assert!(!session.is_ready());
        assert!(matches!(session.lock(), Err(BridgeError::SessionClosed(_))));
    }

    #[test]
    fn wait_ready_times_out_without_agent() {
        let session = Session::bind(&loopback_config()).unwrap();
        assert!(matches!(
            session.wait_ready(Some(Duration::from_millis(10))),
            Err(BridgeError::Protocol(ProtocolError::Timeout(_)))
        ));
    }

    #[test]
    fn close_releases_waiters_and_acceptor() {
        let session = Arc::new(Session::bind(&loopback_config()).unwrap());
        let acceptor = session.spawn_acceptor().unwrap();

        let waiter = {
            let s = Arc::clone(&session);
            thread::spawn(move || s.wait_ready(None))
        };
        thread::sleep(Duration::from_millis(20));
        session.close();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(BridgeError::SessionClosed(_))
        ));
        acceptor.join().unwrap();
        assert!(session.is_closed());
    }

    fn connected_pair(session: &Session) -> (TcpStream, TcpStream) {
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), session.port());
        let agent = TcpStream::connect(addr).unwrap();
        let (accepted, _) = session.listener.accept().unwrap();
        (accepted, agent)
    }

    #[test]
    fn install_after_close_drops_the_agent() {
        let session = Session::bind(&loopback_config()).unwrap();
        let (accepted, mut agent) = connected_pair(&session);
        session.close();

        assert!(!session.install(accepted).unwrap());
        assert!(matches!(session.lock(), Err(BridgeError::SessionClosed(_))));

        agent.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(io::Read::read(&mut agent, &mut buf).unwrap(), 0);
    }

    #[test]
    fn install_on_open_session_marks_ready() {
        let session = Session::bind(&loopback_config()).unwrap();
        let (accepted, _agent) = connected_pair(&session);
        assert!(session.install(accepted).unwrap());
        assert!(session.is_ready());
        assert!(session.lock().is_ok());
    }

    #[test]
    fn handshake_read_is_bounded_as_a_whole() {
        let session = Session::bind(&loopback_config()).unwrap();
        let (accepted, mut agent) = connected_pair(&session);
        let trickle = thread::spawn(move || {
            for byte in [4u8, 0, 0, 0, b'p', b'i', b'n', b'g'] {
                if io::Write::write_all(&mut agent, &[byte]).is_err() {
                    return;
                }
                thread::sleep(Duration::from_millis(150));
            }
        });

        let start = Instant::now();
        let err = session.read_handshake(&accepted).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        ));
        assert!(start.elapsed() < Duration::from_millis(1000));
        drop(accepted);
        trickle.join().unwrap();
    }
}
