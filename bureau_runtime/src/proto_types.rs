//! Hand-written protobuf types for the bureau wire protocol.
//!
//! Uses prost derive macros for encode/decode without prost-build.
//! Field numbers are part of the protocol; never renumber.

use prost::Message;

// ── Envelope ───────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoEnvelope {
    #[prost(oneof = "ProtoKind", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub kind: Option<ProtoKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum ProtoKind {
    #[prost(message, tag = "1")]
    InvokeSyscall(ProtoInvokeSyscall),
    #[prost(message, tag = "2")]
    SyscallReturn(ProtoSyscallReturn),
    #[prost(message, tag = "3")]
    RetrieveMemory(ProtoRetrieveMemory),
    #[prost(message, tag = "4")]
    RetrieveMemoryReturn(ProtoRetrieveMemoryReturn),
    #[prost(message, tag = "5")]
    SyncMemory(ProtoSyncMemory),
    #[prost(message, tag = "6")]
    TargetStrlen(ProtoTargetStrlen),
    #[prost(message, tag = "7")]
    TargetStrlenResponse(ProtoTargetStrlenResponse),
}

// ── Engine → agent ─────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoInvokeSyscall {
    #[prost(uint64, tag = "1")]
    pub num: u64,
    #[prost(uint64, repeated, tag = "2")]
    pub args: Vec<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtoRetrieveResult {
    Ok = 0,
    Abort = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoRetrieveMemoryReturn {
    #[prost(enumeration = "ProtoRetrieveResult", tag = "1")]
    pub result: i32,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoTargetStrlenResponse {
    #[prost(uint64, tag = "1")]
    pub length: u64,
}

// ── Agent → engine ─────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoSyscallReturn {
    #[prost(int64, tag = "1")]
    pub retval: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoRetrieveMemory {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
    #[prost(uint64, tag = "2")]
    pub size: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoSyncMemory {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoTargetStrlen {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
}
