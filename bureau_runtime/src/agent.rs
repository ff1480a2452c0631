//! Agent side of the protocol.
//!
//! An agent connects to a session, sends a handshake ping, then loops:
//! receive `InvokeSyscall`, run it (querying memory through the bridge as
//! needed), answer with `SyscallReturn`. The next `InvokeSyscall` is the
//! bridge's reply to that return.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::messages::{MemoryReply, Message, SYNC_ACK};
use crate::transport::{classify_read_error, read_frame, write_frame, DeadlineStream};

pub const HANDSHAKE: &[u8] = b"ping";

/// A syscall handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallCall {
    pub num: u64,
    pub args: Vec<u64>,
}

pub struct AgentClient {
    stream: TcpStream,
    reply_timeout: Duration,
}

impl AgentClient {
    /// Connect and send the handshake.
    pub fn connect<A: ToSocketAddrs>(addr: A, reply_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut client = Self {
            stream,
            reply_timeout,
        };
        client.send_raw(HANDSHAKE)?;
        debug!(peer = ?client.stream.peer_addr().ok(), "agent handshake sent");
        Ok(client)
    }

    /// Wait for the next delegated syscall.
    pub fn next_call(&mut self) -> Result<SyscallCall> {
        match self.receive()? {
            Message::InvokeSyscall { num, args } => Ok(SyscallCall { num, args }),
            other => Err(unexpected("InvokeSyscall", &other)),
        }
    }

    pub fn retrieve_memory(&mut self, addr: u64, size: u64) -> Result<MemoryReply> {
        self.send(&Message::RetrieveMemory { addr, size })?;
        match self.receive()? {
            Message::RetrieveMemoryReturn(reply) => Ok(reply),
            other => Err(unexpected("RetrieveMemoryReturn", &other)),
        }
    }

    pub fn sync_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.send(&Message::SyncMemory {
            addr,
            data: data.to_vec(),
        })?;
        let ack = self.receive_raw()?;
        if ack != SYNC_ACK {
            return Err(ProtocolError::MalformedMessage(format!(
                "expected sync acknowledgement, got {} bytes",
                ack.len()
            ))
            .into());
        }
        Ok(())
    }

    pub fn target_strlen(&mut self, addr: u64) -> Result<u64> {
        self.send(&Message::TargetStrlen { addr })?;
        match self.receive()? {
            Message::TargetStrlenResponse { length } => Ok(length),
            other => Err(unexpected("TargetStrlenResponse", &other)),
        }
    }

    /// Complete the current syscall. No reply follows until the next call.
    pub fn finish(&mut self, retval: i64) -> Result<()> {
        self.send(&Message::SyscallReturn { retval })
    }

    pub fn send_raw(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, payload)?;
        Ok(())
    }

    pub fn receive_raw(&mut self) -> Result<Vec<u8>> {
        let mut io = DeadlineStream::new(&self.stream, self.reply_timeout);
        read_frame(&mut io).map_err(|e| classify_read_error(e, self.reply_timeout))
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        self.send_raw(&msg.serialize())
    }

    fn receive(&mut self) -> Result<Message> {
        let frame = self.receive_raw()?;
        Ok(Message::parse(&frame)?)
    }
}

fn unexpected(expected: &'static str, got: &Message) -> crate::error::BridgeError {
    ProtocolError::UnexpectedKind {
        expected,
        got: got.kind(),
    }
    .into()
}
