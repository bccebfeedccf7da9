//! Connection registry.
//!
//! Owns every [`RpcSession`] and [`Connection`] by stable identity and keeps
//! the two lookup paths the tap needs: by stack PCB (used when dispatching
//! stack events) and by `(session, peer_fd)` (used when resolving RPC
//! requests that name a client descriptor).
//!
//! `peer_fd` resolution is a scan over the session's connections rather than
//! a keyed index: the mapping handshake has a window in which a descriptor
//! number can transiently belong to two connections (client closed and
//! re-allocated it before we learned of the close), and reconciliation needs
//! to see both.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Instant;

use netcon_stack::Pcb;

/// Stable connection identity; doubles as the stack-side callback token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Stable RPC session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Client-visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// PCB exists, not bound.
    New,
    /// Bound to a local port.
    Bound,
    /// Listening parent; spawns children via accept.
    Listen,
    /// Connect in flight, reply owed.
    Connecting,
    /// Byte stream up in both directions.
    Established,
    /// Teardown started.
    Closing,
}

/// One client socket: a stack PCB tied to the tap-side end of the
/// descriptor-passed stream pair.
pub(crate) struct Connection {
    pub id: ConnId,
    pub pcb: Pcb,
    pub session: SessionId,
    /// Tap-owned end of the stream pair, non-blocking.
    pub local_end: UnixStream,
    /// Descriptor number the client assigned to its end; `None` until the
    /// mapping handshake completes.
    pub peer_fd: Option<i32>,
    pub state: ConnState,
    /// An RPC return value (or mapping) is still owed to the client.
    pub pending_reply: bool,
    /// Client bytes read from `local_end` but not yet accepted by the stack.
    pub tx_buf: Vec<u8>,
    /// Whether the reactor watches `local_end` for readability.
    pub read_interest: bool,
}

/// One connected client process.
pub(crate) struct RpcSession {
    pub id: SessionId,
    /// Rendezvous endpoint, non-blocking, descriptor-passing capable.
    pub stream: UnixStream,
    /// Partial-message accumulator for the RPC demuxer.
    pub rx: Vec<u8>,
    pub last_activity: Instant,
    /// Live connections bound to this session.
    pub conns: HashSet<ConnId>,
}

#[derive(Default)]
pub(crate) struct Registry {
    conns: HashMap<ConnId, Connection>,
    by_pcb: HashMap<Pcb, ConnId>,
    sessions: HashMap<SessionId, RpcSession>,
    next_conn: u64,
    next_session: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_conn: 1,
            next_session: 1,
            ..Self::default()
        }
    }

    pub fn add_session(&mut self, stream: UnixStream) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.sessions.insert(
            id,
            RpcSession {
                id,
                stream,
                rx: Vec::new(),
                last_activity: Instant::now(),
                conns: HashSet::new(),
            },
        );
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&RpcSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut RpcSession> {
        self.sessions.get_mut(&id)
    }

    /// Detach a session. Its connections must already be gone.
    pub fn remove_session(&mut self, id: SessionId) -> Option<RpcSession> {
        self.sessions.remove(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Register a connection for `session`. Fails when the session is gone.
    pub fn add_conn(
        &mut self,
        pcb: Pcb,
        session: SessionId,
        local_end: UnixStream,
    ) -> Option<ConnId> {
        let owner = self.sessions.get_mut(&session)?;
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        owner.conns.insert(id);
        self.by_pcb.insert(pcb, id);
        self.conns.insert(
            id,
            Connection {
                id,
                pcb,
                session,
                local_end,
                peer_fd: None,
                state: ConnState::New,
                pending_reply: false,
                tx_buf: Vec::new(),
                read_interest: true,
            },
        );
        Some(id)
    }

    pub fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Drop a connection from every index and hand it back to the caller
    /// (who owns the teardown of its PCB and stream).
    pub fn remove_conn(&mut self, id: ConnId) -> Option<Connection> {
        let conn = self.conns.remove(&id)?;
        self.by_pcb.remove(&conn.pcb);
        if let Some(session) = self.sessions.get_mut(&conn.session) {
            session.conns.remove(&id);
        }
        Some(conn)
    }

    /// Replace the PCB a connection is keyed by (listen returns a
    /// replacement PCB).
    pub fn rekey_pcb(&mut self, id: ConnId, new_pcb: Pcb) {
        if let Some(conn) = self.conns.get_mut(&id) {
            self.by_pcb.remove(&conn.pcb);
            conn.pcb = new_pcb;
            self.by_pcb.insert(new_pcb, id);
        }
    }

    pub fn conn_by_pcb(&self, pcb: Pcb) -> Option<ConnId> {
        self.by_pcb.get(&pcb).copied()
    }

    /// Resolve a client descriptor within a session. With a transient
    /// duplicate, the oldest connection wins; the mapping handshake
    /// reconciles the rest.
    pub fn conn_by_peer_fd(&self, session: SessionId, fd: i32) -> Option<ConnId> {
        self.conns_of_session(session)
            .into_iter()
            .find(|id| self.conns.get(id).is_some_and(|c| c.peer_fd == Some(fd)))
    }

    /// Oldest connection on `session` still waiting for its mapping reply.
    pub fn oldest_unmapped(&self, session: SessionId) -> Option<ConnId> {
        self.conns_of_session(session).into_iter().find(|id| {
            self.conns
                .get(id)
                .is_some_and(|c| c.peer_fd.is_none() && c.pending_reply)
        })
    }

    /// Connection ids bound to `session`, oldest first.
    pub fn conns_of_session(&self, session: SessionId) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .sessions
            .get(&session)
            .map(|s| s.conns.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session endpoints for the readiness poll.
    pub fn poll_sessions(&self) -> Vec<(SessionId, RawFd)> {
        self.sessions
            .values()
            .map(|s| (s.id, s.stream.as_raw_fd()))
            .collect()
    }

    /// Connection endpoints the reactor should watch: read interest on, and
    /// never for listeners (a listening connection has no byte stream).
    pub fn poll_conns(&self) -> Vec<(ConnId, RawFd)> {
        self.conns
            .values()
            .filter(|c| c.read_interest && c.state != ConnState::Listen)
            .map(|c| (c.id, c.local_end.as_raw_fd()))
            .collect()
    }
}
