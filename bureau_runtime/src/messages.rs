//! Protocol messages and their wire codec.
//!
//! `Message` is the closed set of kinds exchanged between the bridge and
//! an agent. The wire form is a `ProtoEnvelope` (proto_types.rs); this
//! module converts in both directions and rejects anything that does not
//! map to exactly one kind.

use std::fmt;

use prost::Message as _;

use crate::error::ProtocolError;
use crate::proto_types::*;

/// Acknowledgement for `SyncMemory`. A bare sentinel byte, not a message.
pub const SYNC_ACK: &[u8] = b"\x61";

/// Outcome of a memory retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryReply {
    /// Concrete bytes of the requested range.
    Ok(Vec<u8>),
    /// The range is symbolic and cannot be handed out.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    InvokeSyscall { num: u64, args: Vec<u64> },
    SyscallReturn { retval: i64 },
    RetrieveMemory { addr: u64, size: u64 },
    RetrieveMemoryReturn(MemoryReply),
    SyncMemory { addr: u64, data: Vec<u8> },
    TargetStrlen { addr: u64 },
    TargetStrlenResponse { length: u64 },
}

/// Tag of a message, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    InvokeSyscall,
    SyscallReturn,
    RetrieveMemory,
    RetrieveMemoryReturn,
    SyncMemory,
    TargetStrlen,
    TargetStrlenResponse,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::InvokeSyscall => "InvokeSyscall",
            MessageKind::SyscallReturn => "SyscallReturn",
            MessageKind::RetrieveMemory => "RetrieveMemory",
            MessageKind::RetrieveMemoryReturn => "RetrieveMemoryReturn",
            MessageKind::SyncMemory => "SyncMemory",
            MessageKind::TargetStrlen => "TargetStrlen",
            MessageKind::TargetStrlenResponse => "TargetStrlenResponse",
        };
        f.write_str(name)
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::InvokeSyscall { .. } => MessageKind::InvokeSyscall,
            Message::SyscallReturn { .. } => MessageKind::SyscallReturn,
            Message::RetrieveMemory { .. } => MessageKind::RetrieveMemory,
            Message::RetrieveMemoryReturn(_) => MessageKind::RetrieveMemoryReturn,
            Message::SyncMemory { .. } => MessageKind::SyncMemory,
            Message::TargetStrlen { .. } => MessageKind::TargetStrlen,
            Message::TargetStrlenResponse { .. } => MessageKind::TargetStrlenResponse,
        }
    }

    /// Encode to wire bytes. Deterministic.
    pub fn serialize(&self) -> Vec<u8> {
        to_proto(self).encode_to_vec()
    }

    /// Decode wire bytes into exactly one message kind.
    pub fn parse(bytes: &[u8]) -> Result<Message, ProtocolError> {
        let envelope = ProtoEnvelope::decode(bytes)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        from_proto(envelope)
    }
}

fn to_proto(msg: &Message) -> ProtoEnvelope {
    let kind = match msg {
        Message::InvokeSyscall { num, args } => ProtoKind::InvokeSyscall(ProtoInvokeSyscall {
            num: *num,
            args: args.clone(),
        }),
        Message::SyscallReturn { retval } => {
            ProtoKind::SyscallReturn(ProtoSyscallReturn { retval: *retval })
        }
        Message::RetrieveMemory { addr, size } => {
            ProtoKind::RetrieveMemory(ProtoRetrieveMemory { addr: *addr, size: *size })
        }
        Message::RetrieveMemoryReturn(reply) => {
            let (result, data) = match reply {
                MemoryReply::Ok(data) => (ProtoRetrieveResult::Ok, Some(data.clone())),
                MemoryReply::Abort => (ProtoRetrieveResult::Abort, None),
            };
            ProtoKind::RetrieveMemoryReturn(ProtoRetrieveMemoryReturn {
                result: result as i32,
                data,
            })
        }
        Message::SyncMemory { addr, data } => ProtoKind::SyncMemory(ProtoSyncMemory {
            addr: *addr,
            data: data.clone(),
        }),
        Message::TargetStrlen { addr } => ProtoKind::TargetStrlen(ProtoTargetStrlen { addr: *addr }),
        Message::TargetStrlenResponse { length } => {
            ProtoKind::TargetStrlenResponse(ProtoTargetStrlenResponse { length: *length })
        }
    };
    ProtoEnvelope { kind: Some(kind) }
}

fn from_proto(envelope: ProtoEnvelope) -> Result<Message, ProtocolError> {
    // Unknown oneof tags are skipped by the decoder and leave `kind` empty.
    let kind = envelope
        .kind
        .ok_or_else(|| ProtocolError::MalformedMessage("envelope carries no known kind".into()))?;

    let msg = match kind {
        ProtoKind::InvokeSyscall(m) => Message::InvokeSyscall { num: m.num, args: m.args },
        ProtoKind::SyscallReturn(m) => Message::SyscallReturn { retval: m.retval },
        ProtoKind::RetrieveMemory(m) => Message::RetrieveMemory { addr: m.addr, size: m.size },
        ProtoKind::RetrieveMemoryReturn(m) => {
            let result = ProtoRetrieveResult::try_from(m.result).map_err(|_| {
                ProtocolError::MalformedMessage(format!("unknown retrieve result {}", m.result))
            })?;
            let reply = match (result, m.data) {
                (ProtoRetrieveResult::Ok, Some(data)) => MemoryReply::Ok(data),
                (ProtoRetrieveResult::Abort, None) => MemoryReply::Abort,
                (ProtoRetrieveResult::Ok, None) => {
                    return Err(ProtocolError::MalformedMessage(
                        "OK retrieve result without data".into(),
                    ))
                }
                (ProtoRetrieveResult::Abort, Some(_)) => {
                    return Err(ProtocolError::MalformedMessage(
                        "ABORT retrieve result carries data".into(),
                    ))
                }
            };
            Message::RetrieveMemoryReturn(reply)
        }
        ProtoKind::SyncMemory(m) => Message::SyncMemory { addr: m.addr, data: m.data },
        ProtoKind::TargetStrlen(m) => Message::TargetStrlen { addr: m.addr },
        ProtoKind::TargetStrlenResponse(m) => Message::TargetStrlenResponse { length: m.length },
    };
    Ok(msg)
}
