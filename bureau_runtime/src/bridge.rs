//! Bureau — syscall delegation orchestrator.
//!
//! Starts agent sessions and runs delegated syscalls on them. The calling
//! engine thread does all the work and blocks while it waits:
//!   1. AwaitReady  until the session's agent has sent its handshake
//!   2. lock        the session for the whole exchange
//!   3. run         the invocation state machine (invocation.rs)
//!   4. on failure  the session is closed and no actions are returned
//!
//! Sessions share nothing mutable; invocations on different sessions run
//! fully in parallel.

use std::sync::Arc;

use bureau_engine::{Action, MemoryOracle};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::invocation::{PendingInvocation, StrlenPolicy};
use crate::registry::{SessionId, SessionRegistry};
use crate::session::Session;

pub struct Bureau {
    config: BridgeConfig,
    registry: SessionRegistry,
}

impl Bureau {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: SessionRegistry::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bind a new session, start its acceptor and register it.
    pub fn start(&self) -> Result<SessionId> {
        let id = self.registry.register(Session::bind(&self.config)?);
        let session = self
            .registry
            .get(id)
            .ok_or(BridgeError::UnknownSession(id))?;
        if let Err(e) = session.spawn_acceptor() {
            self.registry.remove(id);
            return Err(e.into());
        }
        info!(session = %id, sessions = self.registry.len(), "session started");
        Ok(id)
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    pub fn port(&self, id: SessionId) -> Option<u16> {
        self.registry.get(id).map(|s| s.port())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.registry.ids()
    }

    /// Close a session and forget it.
    pub fn close(&self, id: SessionId) -> Result<()> {
        let session = self
            .registry
            .remove(id)
            .ok_or(BridgeError::UnknownSession(id))?;
        session.close();
        Ok(())
    }

    /// Delegate syscall `num` to the agent of session `id`.
    ///
    /// Blocks until the agent has connected and resolved the call.
    /// Returns the actions to apply in order, ending with exactly one
    /// `Action::SyscallReturn`.
    pub fn invoke_syscall<M>(
        &self,
        id: SessionId,
        oracle: &M,
        num: u64,
        args: &[u64],
    ) -> Result<Vec<Action>>
    where
        M: MemoryOracle + ?Sized,
    {
        let session = self
            .registry
            .get(id)
            .ok_or(BridgeError::UnknownSession(id))?;

        debug!(session = %id, num, "waiting for agent");
        session.wait_ready(self.config.ready_timeout())?;

        let mut guard = session.lock()?;
        let invocation = PendingInvocation::new(oracle, num, args, self.strlen_policy());
        match invocation.run(&mut guard) {
            Ok(actions) => {
                debug!(session = %id, num, actions = actions.len(), "syscall resolved");
                Ok(actions)
            }
            Err(e) => {
                warn!(session = %id, num, error = %e, "delegated syscall aborted");
                if e.poisons_session() {
                    guard.poison();
                }
                Err(e)
            }
        }
    }

    fn strlen_policy(&self) -> StrlenPolicy {
        StrlenPolicy {
            max_scan: self.config.strlen_max_scan,
            max_symbolic: self.config.strlen_max_symbolic,
        }
    }
}

impl Drop for Bureau {
    fn drop(&mut self) {
        for id in self.registry.ids() {
            if let Some(session) = self.registry.remove(id) {
                session.close();
            }
        }
    }
}
