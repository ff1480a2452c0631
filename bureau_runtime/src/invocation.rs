//! Invocation state machine — one delegated syscall, start to finish.
//!
//! States:
//!   Sent        InvokeSyscall{num, args} goes out on the channel
//!   AwaitReply  each agent message is either the final SyscallReturn
//!               or a memory sub-exchange answered in place
//!   Done        actions are handed back; the engine state is released
//!
//! Readiness and locking happen before this point (bridge.rs). The
//! machine only needs an `Exchange` and a borrowed `MemoryOracle`.

use bureau_engine::{Action, MemoryOracle};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::messages::{MemoryReply, Message, SYNC_ACK};
use crate::transport::{Exchange, MAX_FRAME_LEN};

/// Bounds for the string-length scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrlenPolicy {
    pub max_scan: u64,
    pub max_symbolic: u64,
}

impl Default for StrlenPolicy {
    fn default() -> Self {
        Self {
            max_scan: 4096,
            max_symbolic: 1,
        }
    }
}

/// Largest retrieval whose reply still fits in one frame.
const MAX_RETRIEVE_SIZE: u64 = (MAX_FRAME_LEN - 64) as u64;

const LEGAL_AGENT_KINDS: &str = "SyscallReturn, RetrieveMemory, SyncMemory or TargetStrlen";

/// A syscall in flight. Owns the accumulated actions until completion.
pub struct PendingInvocation<'a, M: MemoryOracle + ?Sized> {
    num: u64,
    args: Vec<u64>,
    oracle: &'a M,
    strlen: StrlenPolicy,
    actions: Vec<Action>,
}

impl<'a, M: MemoryOracle + ?Sized> PendingInvocation<'a, M> {
    pub fn new(oracle: &'a M, num: u64, args: &[u64], strlen: StrlenPolicy) -> Self {
        Self {
            num,
            args: args.to_vec(),
            oracle,
            strlen,
            actions: Vec::new(),
        }
    }

    /// Drive the exchange to completion. On success the last action is
    /// always `SyscallReturn`; on failure nothing is returned.
    pub fn run<X: Exchange + ?Sized>(mut self, exchange: &mut X) -> Result<Vec<Action>> {
        let request = Message::InvokeSyscall {
            num: self.num,
            args: std::mem::take(&mut self.args),
        };
        debug!(num = self.num, "sending InvokeSyscall");
        exchange.send(&request.serialize())?;

        loop {
            let frame = exchange.receive()?;
            let msg = Message::parse(&frame)?;
            debug!(kind = %msg.kind(), "agent message");

            match msg {
                Message::SyscallReturn { retval } => {
                    self.actions.push(Action::SyscallReturn { retval });
                    return Ok(self.actions);
                }
                Message::RetrieveMemory { addr, size } => {
                    let reply = self.retrieve(addr, size)?;
                    exchange.send(&Message::RetrieveMemoryReturn(reply).serialize())?;
                }
                Message::SyncMemory { addr, data } => {
                    debug!(addr, len = data.len(), "agent synced memory");
                    self.actions.push(Action::WriteMemory { addr, bytes: data });
                    exchange.send(SYNC_ACK)?;
                }
                Message::TargetStrlen { addr } => {
                    let length = self.target_strlen(addr)?;
                    exchange.send(&Message::TargetStrlenResponse { length }.serialize())?;
                }
                other @ (Message::InvokeSyscall { .. }
                | Message::RetrieveMemoryReturn(_)
                | Message::TargetStrlenResponse { .. }) => {
                    return Err(ProtocolError::UnexpectedKind {
                        expected: LEGAL_AGENT_KINDS,
                        got: other.kind(),
                    }
                    .into());
                }
            }
        }
    }

    /// Symbolic data is refused, never concretized on the agent's behalf.
    fn retrieve(&self, addr: u64, size: u64) -> Result<MemoryReply> {
        if size > MAX_RETRIEVE_SIZE {
            return Err(ProtocolError::MalformedMessage(format!(
                "retrieval of {} bytes exceeds the frame limit",
                size
            ))
            .into());
        }
        let region = self.oracle.load(addr, size)?;
        if self.oracle.is_symbolic(&region) {
            debug!(addr, size, "requested memory is symbolic, aborting retrieval");
            return Ok(MemoryReply::Abort);
        }
        let data = self.oracle.eval_concrete(&region)?;
        debug!(addr, size, "returning concrete memory");
        Ok(MemoryReply::Ok(data))
    }

    /// Offset of the NUL terminator. When the match position is symbolic
    /// the furthest candidate plus one is reported.
    fn target_strlen(&self, addr: u64) -> Result<u64> {
        let found = self
            .oracle
            .find_byte(addr, 0, self.strlen.max_scan, self.strlen.max_symbolic)?;
        let length = match found.max_index() {
            None => {
                warn!(addr, max_scan = self.strlen.max_scan, "no terminator within scan bound");
                self.strlen.max_scan
            }
            Some(max) if self.oracle.is_symbolic(&found.region) => max + 1,
            Some(max) => max,
        };
        debug!(addr, length, "target strlen");
        Ok(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use bureau_engine::SimState;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Agent side played from a fixed script of outgoing frames.
    #[derive(Default)]
    struct ScriptedAgent {
        inbox: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl ScriptedAgent {
        fn new(script: Vec<Message>) -> Self {
            Self {
                inbox: script.iter().map(Message::serialize).collect(),
                sent: Vec::new(),
            }
        }

        fn replies(&self) -> Vec<Message> {
            self.sent[1..]
                .iter()
                .filter(|f| f.as_slice() != SYNC_ACK)
                .map(|f| Message::parse(f).unwrap())
                .collect()
        }
    }

    impl Exchange for ScriptedAgent {
        fn send(&mut self, payload: &[u8]) -> Result<()> {
            self.sent.push(payload.to_vec());
            Ok(())
        }

        fn receive(&mut self) -> Result<Vec<u8>> {
            self.inbox
                .pop_front()
                .ok_or_else(|| ProtocolError::Timeout(Duration::from_millis(1)).into())
        }
    }

    fn run(state: &SimState, script: Vec<Message>) -> (Result<Vec<Action>>, ScriptedAgent) {
        let mut agent = ScriptedAgent::new(script);
        let result =
            PendingInvocation::new(state, 4, &[1, 0x1000, 5], StrlenPolicy::default()).run(&mut agent);
        (result, agent)
    }

    fn memory() -> SimState {
        let mut state = SimState::new();
        state.map(0x1000, b"hello\0");
        state.map(0x2000, b"ab");
        state.map(0x2003, b"cd\0");
        state
    }

    #[test]
    fn sends_invoke_first() {
        let (_, agent) = run(&memory(), vec![Message::SyscallReturn { retval: 0 }]);
        assert_eq!(
            Message::parse(&agent.sent[0]).unwrap(),
            Message::InvokeSyscall { num: 4, args: vec![1, 0x1000, 5] }
        );
    }

    #[test]
    fn single_return_yields_single_action() {
        let (result, agent) = run(&memory(), vec![Message::SyscallReturn { retval: 5 }]);
        assert_eq!(result.unwrap(), vec![Action::SyscallReturn { retval: 5 }]);
        assert_eq!(agent.sent.len(), 1);
    }

    #[test]
    fn sync_memory_keeps_arrival_order() {
        let (result, agent) = run(
            &memory(),
            vec![
                Message::SyncMemory { addr: 0x30, data: vec![3] },
                Message::SyncMemory { addr: 0x10, data: vec![1] },
                Message::SyncMemory { addr: 0x20, data: vec![2] },
                Message::SyscallReturn { retval: 3 },
            ],
        );
        assert_eq!(
            result.unwrap(),
            vec![
                Action::WriteMemory { addr: 0x30, bytes: vec![3] },
                Action::WriteMemory { addr: 0x10, bytes: vec![1] },
                Action::WriteMemory { addr: 0x20, bytes: vec![2] },
                Action::SyscallReturn { retval: 3 },
            ]
        );
        assert!(agent.sent[1..].iter().all(|f| f.as_slice() == SYNC_ACK));
    }

    #[test]
    fn concrete_retrieve_returns_bytes() {
        let (result, agent) = run(
            &memory(),
            vec![
                Message::RetrieveMemory { addr: 0x1000, size: 5 },
                Message::SyscallReturn { retval: 5 },
            ],
        );
        assert!(result.is_ok());
        assert_eq!(
            agent.replies(),
            vec![Message::RetrieveMemoryReturn(MemoryReply::Ok(b"hello".to_vec()))]
        );
    }

    #[test]
    fn symbolic_retrieve_aborts_and_keeps_waiting() {
        let (result, agent) = run(
            &memory(),
            vec![
                Message::RetrieveMemory { addr: 0x2000, size: 4 },
                Message::SyscallReturn { retval: -14 },
            ],
        );
        assert_eq!(result.unwrap(), vec![Action::SyscallReturn { retval: -14 }]);
        assert_eq!(
            agent.replies(),
            vec![Message::RetrieveMemoryReturn(MemoryReply::Abort)]
        );
    }

    #[test]
    fn strlen_of_concrete_string_is_terminator_index() {
        let (_, agent) = run(
            &memory(),
            vec![
                Message::TargetStrlen { addr: 0x1000 },
                Message::SyscallReturn { retval: 0 },
            ],
        );
        assert_eq!(agent.replies(), vec![Message::TargetStrlenResponse { length: 5 }]);
    }

    #[test]
    fn strlen_of_symbolic_match_is_max_index_plus_one() {
        // "ab" ? "cd\0": candidates at 2 and 5
        let (_, agent) = run(
            &memory(),
            vec![
                Message::TargetStrlen { addr: 0x2000 },
                Message::SyscallReturn { retval: 0 },
            ],
        );
        assert_eq!(agent.replies(), vec![Message::TargetStrlenResponse { length: 6 }]);
    }

    #[test]
    fn strlen_without_terminator_reports_scan_bound() {
        let mut state = SimState::new();
        state.map(0x9000, &[b'A'; 5000]);
        let (_, agent) = run(
            &state,
            vec![
                Message::TargetStrlen { addr: 0x9000 },
                Message::SyscallReturn { retval: 0 },
            ],
        );
        assert_eq!(agent.replies(), vec![Message::TargetStrlenResponse { length: 4096 }]);
    }

    #[test]
    fn illegal_kinds_abort() {
        for bad in [
            Message::InvokeSyscall { num: 1, args: vec![] },
            Message::RetrieveMemoryReturn(MemoryReply::Abort),
            Message::TargetStrlenResponse { length: 1 },
        ] {
            let (result, _) = run(
                &memory(),
                vec![Message::SyncMemory { addr: 0, data: vec![0] }, bad],
            );
            assert!(matches!(
                result,
                Err(BridgeError::Protocol(ProtocolError::UnexpectedKind { .. }))
            ));
        }
    }

    #[test]
    fn malformed_frame_aborts() {
        let mut agent = ScriptedAgent::default();
        agent.inbox.push_back(vec![0xff, 0xff]);
        let state = memory();
        let result = PendingInvocation::new(&state, 0, &[], StrlenPolicy::default()).run(&mut agent);
        assert!(matches!(
            result,
            Err(BridgeError::Protocol(ProtocolError::MalformedMessage(_)))
        ));
    }

    #[test]
    fn silent_agent_times_out() {
        let (result, _) = run(&memory(), vec![]);
        assert!(matches!(
            result,
            Err(BridgeError::Protocol(ProtocolError::Timeout(_)))
        ));
    }

    #[test]
    fn oversized_retrieve_aborts() {
        let (result, agent) = run(
            &memory(),
            vec![Message::RetrieveMemory { addr: 0, size: u64::MAX }],
        );
        assert!(matches!(
            result,
            Err(BridgeError::Protocol(ProtocolError::MalformedMessage(_)))
        ));
        assert_eq!(agent.sent.len(), 1);
    }

    #[test]
    fn oracle_failure_aborts() {
        let (result, _) = run(
            &memory(),
            vec![Message::RetrieveMemory { addr: u64::MAX, size: 16 }],
        );
        assert!(matches!(result, Err(BridgeError::Oracle(_))));
    }
}
