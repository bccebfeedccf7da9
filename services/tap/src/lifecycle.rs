//! Connection lifecycle: RPC request handlers, stack event dispatch, and
//! teardown paths.
//!
//! Every function here is called with the stack lock held (the reactor and
//! `put_frame` wrap their work in it); the registry lock is only ever taken
//! inside, never the other way around.

use std::io::Write;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{send, MsgFlags};
use netcon_stack::{
    Pcb, StackError, StackEvent, TcpIpStack, ACCEPTED_POLL_FREQ, APPLICATION_POLL_FREQ,
};
use tracing::{debug, error, info, trace, warn};

use crate::registry::{ConnId, ConnState, SessionId};
use crate::rpc::{self, RpcRequest};
use crate::{pump, TapShared};

/// Demuxed entry point for one client request.
pub(crate) fn handle_request(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    sid: SessionId,
    request: RpcRequest,
) {
    trace!(%sid, ?request, "rpc request");
    match request {
        RpcRequest::Socket { .. } => handle_socket(shared, stack, sid),
        RpcRequest::Listen { sockfd, backlog } => {
            handle_listen(shared, stack, sid, sockfd, backlog)
        }
        RpcRequest::Bind { sockfd, addr } => handle_bind(shared, stack, sid, sockfd, addr),
        RpcRequest::Connect { sockfd, addr } => handle_connect(shared, stack, sid, sockfd, addr),
        RpcRequest::Map { fd } => handle_map(shared, stack, sid, fd),
        RpcRequest::MapRequest { fd } => handle_map_request(shared, sid, fd),
    }
}

// ============================================================================
// RPC handlers
// ============================================================================

/// SOCKET: allocate a PCB and a stream pair, pass the client its end.
fn handle_socket(shared: &TapShared, stack: &mut dyn TcpIpStack, sid: SessionId) {
    let pcb = match stack.new_pcb() {
        Ok(pcb) => pcb,
        Err(e) => {
            warn!(%sid, error = %e, "pcb allocation failed");
            let reg = shared.lock_registry();
            if let Some(session) = reg.session(sid) {
                let _ = rpc::send_fd(&session.stream, None);
            }
            drop(reg);
            send_retval_session(shared, sid, -1, Errno::ENOMEM as i32);
            return;
        }
    };

    let (local_end, client_end) = match UnixStream::pair() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%sid, error = %e, "stream pair allocation failed");
            let _ = stack.close(pcb);
            send_retval_session(
                shared,
                sid,
                -1,
                e.raw_os_error().unwrap_or(Errno::ENOMEM as i32),
            );
            return;
        }
    };
    let _ = local_end.set_nonblocking(true);

    let mut reg = shared.lock_registry();
    let Some(conn_id) = reg.add_conn(pcb, sid, local_end) else {
        drop(reg);
        let _ = stack.close(pcb);
        return;
    };
    if let Some(conn) = reg.conn_mut(conn_id) {
        // Mapping reply is owed: the client must answer with MAP.
        conn.pending_reply = true;
    }
    stack.set_conn_token(pcb, Some(conn_id.0));

    let handed_off = reg
        .session(sid)
        .map(|s| rpc::send_fd(&s.stream, Some(client_end.as_raw_fd())).is_ok())
        .unwrap_or(false);
    drop(reg);
    drop(client_end); // our copy of the client's end

    if !handed_off {
        warn!(%sid, %conn_id, "descriptor handoff failed");
        close_conn(shared, stack, conn_id, "descriptor handoff failed");
        return;
    }
    shared
        .stats
        .connections_opened
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    shared.wake();
    debug!(%sid, %conn_id, %pcb, "socket created, awaiting mapping");
}

/// MAP: the client tells us which descriptor number it assigned to the pair
/// end we sent it, completing the handshake started by SOCKET or an accept.
fn handle_map(shared: &TapShared, stack: &mut dyn TcpIpStack, sid: SessionId, fd: i32) {
    let mut reg = shared.lock_registry();
    let Some(conn_id) = reg.oldest_unmapped(sid) else {
        debug!(%sid, fd, "mapping with no connection awaiting one, dropping");
        return;
    };
    if let Some(conn) = reg.conn_mut(conn_id) {
        conn.peer_fd = Some(fd);
        conn.pending_reply = false;
    }
    debug!(%sid, %conn_id, fd, "mapping complete");

    // The client may have closed and re-allocated the same descriptor number
    // before we saw the close. Probe the previous owner: a dead pair means a
    // stale entry we can reap, a live one is a shim bug we cannot paper over.
    let duplicate = reg
        .conns_of_session(sid)
        .into_iter()
        .filter(|&id| id != conn_id)
        .find(|&id| reg.conn(id).is_some_and(|c| c.peer_fd == Some(fd)));
    let Some(dup_id) = duplicate else {
        return;
    };
    let alive = reg
        .conn(dup_id)
        .map(|c| probe_alive(&c.local_end))
        .unwrap_or(false);
    drop(reg);
    if alive {
        error!(%sid, %dup_id, fd, "descriptor mapped to two live connections");
        panic!("descriptor {fd} mapped to two live connections on {sid}");
    }
    warn!(%sid, %dup_id, fd, "stale duplicate mapping, closing the original");
    close_conn(shared, stack, dup_id, "stale duplicate mapping");
}

/// MAP_REQ: "is this descriptor one of ours?"
fn handle_map_request(shared: &TapShared, sid: SessionId, fd: i32) {
    let reg = shared.lock_registry();
    let mapped = reg.conn_by_peer_fd(sid, fd).is_some();
    drop(reg);
    send_retval_session(shared, sid, i32::from(mapped), 0);
}

/// BIND: attach the PCB to a local port on the interface address.
fn handle_bind(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    sid: SessionId,
    sockfd: i32,
    addr: SocketAddrV4,
) {
    let reg = shared.lock_registry();
    let resolved = reg
        .conn_by_peer_fd(sid, sockfd)
        .and_then(|id| reg.conn(id).map(|c| (id, c.pcb, c.state)));
    drop(reg);
    let Some((conn_id, pcb, state)) = resolved else {
        send_retval_session(shared, sid, -1, Errno::EBADF as i32);
        return;
    };
    if state != ConnState::New {
        send_retval_conn(shared, stack, conn_id, -1, Errno::EINVAL as i32);
        return;
    }

    // Binds resolve against the interface address, whatever the client put
    // in the sockaddr; only the port is honored.
    match stack.bind(pcb, shared.config.ip, addr.port()) {
        Ok(()) => {
            if let Some(conn) = shared.lock_registry().conn_mut(conn_id) {
                conn.state = ConnState::Bound;
            }
            debug!(%conn_id, port = addr.port(), "bound");
            send_retval_conn(shared, stack, conn_id, 0, 0);
        }
        Err(e) => {
            let errno = match e {
                StackError::Use => Errno::EADDRINUSE,
                StackError::Mem | StackError::Buf => Errno::ENOMEM,
                _ => Errno::EINVAL,
            };
            debug!(%conn_id, port = addr.port(), error = %e, "bind failed");
            send_retval_conn(shared, stack, conn_id, -1, errno as i32);
        }
    }
}

/// LISTEN: swap the PCB for a listening one and start accepting.
fn handle_listen(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    sid: SessionId,
    sockfd: i32,
    backlog: i32,
) {
    let reg = shared.lock_registry();
    let resolved = reg
        .conn_by_peer_fd(sid, sockfd)
        .and_then(|id| reg.conn(id).map(|c| (id, c.pcb, c.state)));
    drop(reg);
    let Some((conn_id, pcb, state)) = resolved else {
        debug!(%sid, sockfd, "listen for unknown descriptor, dropping");
        return;
    };
    if state == ConnState::Listen {
        debug!(%conn_id, "already listening, dropping");
        return;
    }

    match stack.listen(pcb, backlog.max(0) as usize) {
        Ok(listener) => {
            let mut reg = shared.lock_registry();
            reg.rekey_pcb(conn_id, listener);
            if let Some(conn) = reg.conn_mut(conn_id) {
                conn.state = ConnState::Listen;
                // A listening connection carries no byte stream.
                conn.read_interest = false;
            }
            drop(reg);
            stack.set_conn_token(listener, Some(conn_id.0));
            stack.on_accept(listener, true);
            debug!(%conn_id, %listener, backlog, "listening");
            send_retval_conn(shared, stack, conn_id, 0, 0);
        }
        Err(e) => {
            let errno = match e {
                StackError::Val => Errno::EINVAL,
                _ => Errno::ENOMEM,
            };
            warn!(%conn_id, error = %e, "listen failed");
            send_retval_conn(shared, stack, conn_id, -1, errno as i32);
        }
    }
}

/// CONNECT: arm the stream callbacks and start an asynchronous connect. The
/// reply is deferred to `Connected` or `Error` unless the stack fails
/// synchronously.
fn handle_connect(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    sid: SessionId,
    sockfd: i32,
    addr: SocketAddrV4,
) {
    let reg = shared.lock_registry();
    let resolved = reg
        .conn_by_peer_fd(sid, sockfd)
        .and_then(|id| reg.conn(id).map(|c| (id, c.pcb)));
    drop(reg);
    let Some((conn_id, pcb)) = resolved else {
        debug!(%sid, sockfd, "connect for unknown descriptor, dropping");
        return;
    };

    stack.set_conn_token(pcb, Some(conn_id.0));
    stack.on_sent(pcb, true);
    stack.on_recv(pcb, true);
    stack.on_err(pcb, true);
    stack.on_connected(pcb, true);
    stack.on_poll(pcb, Some(APPLICATION_POLL_FREQ));

    match stack.connect(pcb, *addr.ip(), addr.port()) {
        Ok(()) => {
            let mut reg = shared.lock_registry();
            if let Some(conn) = reg.conn_mut(conn_id) {
                conn.state = ConnState::Connecting;
                conn.pending_reply = true;
            }
            debug!(%conn_id, remote = %addr, "connect in flight");
        }
        Err(e) => {
            let errno = match e {
                StackError::IsConn => Errno::EISCONN,
                StackError::Use => Errno::EADDRINUSE,
                StackError::Val => Errno::EINVAL,
                StackError::Route => Errno::ENETUNREACH,
                StackError::Buf | StackError::Mem => Errno::EAGAIN,
                _ => Errno::EAGAIN,
            };
            debug!(%conn_id, remote = %addr, error = %e, "connect failed synchronously");
            send_retval_conn(shared, stack, conn_id, -1, errno as i32);
        }
    }
}

// ============================================================================
// Stack event dispatch
// ============================================================================

/// Dispatch one drained stack event. Runs under the stack lock, on whichever
/// thread holds it.
pub(crate) fn dispatch_event(shared: &TapShared, stack: &mut dyn TcpIpStack, event: StackEvent) {
    match event {
        StackEvent::Accept { parent, child } => {
            handle_accept(shared, stack, ConnId(parent), child)
        }
        StackEvent::Recv { token, data } => {
            pump::handle_recv(shared, stack, ConnId(token), &data)
        }
        StackEvent::RemoteClose { token } => {
            close_conn(shared, stack, ConnId(token), "remote close")
        }
        StackEvent::Sent { token, len } => {
            if len > 0 {
                pump::handle_sent(shared, ConnId(token));
            }
        }
        StackEvent::Connected { token } => {
            let conn_id = ConnId(token);
            if let Some(conn) = shared.lock_registry().conn_mut(conn_id) {
                conn.state = ConnState::Established;
            }
            debug!(%conn_id, "connected");
            send_retval_conn(shared, stack, conn_id, 0, 0);
        }
        StackEvent::Error { token, error } => {
            let conn_id = ConnId(token);
            let errno = errno_for(error);
            debug!(%conn_id, %error, errno, "connection error");
            send_retval_conn(shared, stack, conn_id, -1, errno);
            close_conn(shared, stack, conn_id, "stack error");
        }
        StackEvent::Poll { token } => pump::pump_buffered(shared, stack, ConnId(token)),
    }
}

/// A listener handshake completed: build the child connection, unblock the
/// shim's accept stub with the sentinel byte, and pass the new descriptor.
fn handle_accept(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    parent_id: ConnId,
    child_pcb: Pcb,
) {
    let mut reg = shared.lock_registry();
    let Some((sid, parent_pcb)) = reg.conn(parent_id).map(|c| (c.session, c.pcb)) else {
        drop(reg);
        debug!(%parent_id, %child_pcb, "accept for unknown parent, dropping child");
        let _ = stack.close(child_pcb);
        return;
    };

    let (local_end, client_end) = match UnixStream::pair() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%parent_id, error = %e, "stream pair allocation failed for accept");
            drop(reg);
            send_retval_session(
                shared,
                sid,
                -1,
                e.raw_os_error().unwrap_or(Errno::ENOMEM as i32),
            );
            let _ = stack.close(child_pcb);
            return;
        }
    };
    let _ = local_end.set_nonblocking(true);

    let Some(child_id) = reg.add_conn(child_pcb, sid, local_end) else {
        drop(reg);
        let _ = stack.close(child_pcb);
        return;
    };
    if let Some(child) = reg.conn_mut(child_id) {
        child.state = ConnState::Established;
        child.pending_reply = true; // awaits its own MAP
    }

    // The shim's accept stub blocks reading one byte from the parent's pair.
    let sentinel_ok = reg
        .conn_mut(parent_id)
        .map(|parent| matches!(parent.local_end.write(b"z"), Ok(1)))
        .unwrap_or(false);
    if !sentinel_ok {
        warn!(%parent_id, %child_id, "unable to signal accept, dropping child");
        drop(reg);
        close_conn(shared, stack, child_id, "accept signal failed");
        return;
    }

    let handed_off = reg
        .session(sid)
        .map(|s| rpc::send_fd(&s.stream, Some(client_end.as_raw_fd())).is_ok())
        .unwrap_or(false);
    drop(reg);
    drop(client_end);
    if !handed_off {
        warn!(%parent_id, %child_id, "descriptor handoff failed, dropping child");
        close_conn(shared, stack, child_id, "descriptor handoff failed");
        return;
    }

    stack.set_conn_token(child_pcb, Some(child_id.0));
    stack.on_recv(child_pcb, true);
    stack.on_err(child_pcb, true);
    stack.on_sent(child_pcb, true);
    stack.on_poll(child_pcb, Some(ACCEPTED_POLL_FREQ));
    stack.accepted(parent_pcb);

    shared
        .stats
        .connections_opened
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    shared.wake();
    debug!(%parent_id, %child_id, %child_pcb, "accepted, awaiting mapping");
}

// ============================================================================
// Teardown and replies
// ============================================================================

/// Close one connection: detach every stack callback, close the PCB, drop
/// the tap side of the stream pair, remove it from the registry.
pub(crate) fn close_conn(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    conn_id: ConnId,
    reason: &str,
) {
    let mut reg = shared.lock_registry();
    let Some(conn) = reg.remove_conn(conn_id) else {
        return;
    };
    drop(reg);

    stack.set_conn_token(conn.pcb, None);
    stack.on_accept(conn.pcb, false);
    stack.on_recv(conn.pcb, false);
    stack.on_sent(conn.pcb, false);
    stack.on_err(conn.pcb, false);
    stack.on_connected(conn.pcb, false);
    stack.on_poll(conn.pcb, None);
    if let Err(e) = stack.close(conn.pcb) {
        trace!(%conn_id, pcb = %conn.pcb, error = %e, "pcb already gone");
    }
    // conn.local_end drops here, closing our half of the pair.

    shared
        .stats
        .connections_closed
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    debug!(%conn_id, reason, "connection closed");
}

/// Close a session: every connection bound to it first, then the endpoint.
pub(crate) fn close_session(shared: &TapShared, stack: &mut dyn TcpIpStack, sid: SessionId) {
    let conn_ids = shared.lock_registry().conns_of_session(sid);
    for conn_id in conn_ids {
        close_conn(shared, stack, conn_id, "session closed");
    }
    if shared.lock_registry().remove_session(sid).is_some() {
        info!(%sid, "rpc session closed");
    }
}

/// Deliver a `RETVAL` for a connection's pending RPC. Delivery failure means
/// the session is dead from our side; the connection goes with it.
fn send_retval_conn(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    conn_id: ConnId,
    retval: i32,
    errno: i32,
) {
    let mut reg = shared.lock_registry();
    let Some(sid) = reg.conn(conn_id).map(|c| c.session) else {
        return;
    };
    let delivered = reg
        .session(sid)
        .map(|s| (&s.stream).write_all(&rpc::encode_retval(retval, errno)).is_ok())
        .unwrap_or(false);
    if delivered {
        if let Some(conn) = reg.conn_mut(conn_id) {
            conn.pending_reply = false;
        }
        return;
    }
    drop(reg);
    warn!(%conn_id, "unable to deliver return value, closing connection");
    close_conn(shared, stack, conn_id, "retval delivery failed");
}

/// Deliver a `RETVAL` that has no connection context.
fn send_retval_session(shared: &TapShared, sid: SessionId, retval: i32, errno: i32) {
    let reg = shared.lock_registry();
    if let Some(session) = reg.session(sid) {
        if let Err(e) = (&session.stream).write_all(&rpc::encode_retval(retval, errno)) {
            warn!(%sid, error = %e, "unable to deliver return value");
        }
    }
}

/// One-byte probe of a connection's pair without raising SIGPIPE. A refused
/// send means the client side is gone.
fn probe_alive(stream: &UnixStream) -> bool {
    match send(stream.as_raw_fd(), b"z", MsgFlags::MSG_NOSIGNAL) {
        Ok(_) => true,
        Err(Errno::EAGAIN) => true, // full but alive
        Err(_) => false,
    }
}

/// Stack error to client-visible errno. Errors with no sensible errno
/// correlate report `-1`.
fn errno_for(error: StackError) -> i32 {
    match error {
        StackError::Mem => Errno::ENOMEM as i32,
        StackError::Buf => Errno::ENOBUFS as i32,
        StackError::Timeout => Errno::ETIMEDOUT as i32,
        StackError::Route => Errno::ENETUNREACH as i32,
        StackError::InProgress => Errno::EINPROGRESS as i32,
        StackError::Val => Errno::EINVAL as i32,
        StackError::WouldBlock => Errno::EWOULDBLOCK as i32,
        StackError::Use => Errno::EADDRINUSE as i32,
        StackError::IsConn => Errno::EISCONN as i32,
        StackError::Abort => Errno::ECONNREFUSED as i32,
        StackError::Reset
        | StackError::Closed
        | StackError::Conn
        | StackError::Arg
        | StackError::Interface => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::test_shared;
    use netcon_stack::{MockCall, MockStack};
    use std::io::Read;
    use std::net::Ipv4Addr;
    use std::os::fd::OwnedFd;

    /// A connected client session: the tap-side stream is registered, the
    /// shim-side stream is handed back for assertions.
    fn client_session(reg: &mut Registry) -> (SessionId, UnixStream) {
        let (tap_side, shim_side) = UnixStream::pair().unwrap();
        tap_side.set_nonblocking(true).unwrap();
        let sid = reg.add_session(tap_side);
        (sid, shim_side)
    }

    fn read_retval(shim: &mut UnixStream) -> (i32, i32) {
        let mut buf = [0u8; rpc::RETVAL_LEN];
        shim.read_exact(&mut buf).unwrap();
        rpc::parse_retval(&buf).unwrap()
    }

    fn socket_and_map(
        shared: &crate::TapShared,
        stack: &mut MockStack,
        sid: SessionId,
        shim: &UnixStream,
        fd: i32,
    ) -> (ConnId, OwnedFd) {
        handle_socket(shared, stack, sid);
        let client_fd = rpc::recv_fd(shim).unwrap().expect("descriptor expected");
        handle_map(shared, stack, sid, fd);
        let conn_id = shared
            .lock_registry()
            .conn_by_peer_fd(sid, fd)
            .expect("mapping registered");
        (conn_id, client_fd)
    }

    #[test]
    fn test_socket_hands_out_descriptor_and_awaits_map() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, shim) = client_session(&mut shared.lock_registry());

        handle_socket(&shared, &mut stack, sid);

        let fd = rpc::recv_fd(&shim).unwrap();
        assert!(fd.is_some());
        let reg = shared.lock_registry();
        let conn_id = reg.oldest_unmapped(sid).expect("connection pending map");
        let conn = reg.conn(conn_id).unwrap();
        assert_eq!(conn.state, ConnState::New);
        assert!(conn.pending_reply);
        assert_eq!(stack.token(conn.pcb), Some(conn_id.0));
    }

    #[test]
    fn test_socket_failure_reports_enomem_without_descriptor() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        stack.fail_pcb_alloc = true;
        let (sid, mut shim) = client_session(&mut shared.lock_registry());

        handle_socket(&shared, &mut stack, sid);

        assert!(rpc::recv_fd(&shim).unwrap().is_none());
        assert_eq!(read_retval(&mut shim), (-1, Errno::ENOMEM as i32));
        assert_eq!(shared.lock_registry().conn_count(), 0);
    }

    #[test]
    fn test_map_then_map_request() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _client_fd) = socket_and_map(&shared, &mut stack, sid, &shim, 17);

        assert_eq!(
            shared.lock_registry().conn(conn_id).unwrap().peer_fd,
            Some(17)
        );

        handle_map_request(&shared, sid, 17);
        assert_eq!(read_retval(&mut shim), (1, 0));
        handle_map_request(&shared, sid, 99);
        assert_eq!(read_retval(&mut shim), (0, 0));
    }

    #[test]
    fn test_bind_success_and_state() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 17);

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777);
        handle_bind(&shared, &mut stack, sid, 17, addr);

        assert_eq!(read_retval(&mut shim), (0, 0));
        assert_eq!(
            shared.lock_registry().conn(conn_id).unwrap().state,
            ConnState::Bound
        );
        // The bind lands on the interface address, not the client's.
        assert!(stack.calls().iter().any(|c| matches!(
            c,
            MockCall::Bind { addr, port: 7777, .. } if *addr == shared.config.ip
        )));
    }

    #[test]
    fn test_bind_conflict_reports_eaddrinuse() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (_conn, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 17);

        stack.fail_bind = Some(StackError::Use);
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777);
        handle_bind(&shared, &mut stack, sid, 17, addr);
        assert_eq!(read_retval(&mut shim), (-1, Errno::EADDRINUSE as i32));
    }

    #[test]
    fn test_bind_unknown_descriptor_reports_ebadf() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777);
        handle_bind(&shared, &mut stack, sid, 42, addr);
        assert_eq!(read_retval(&mut shim), (-1, Errno::EBADF as i32));
    }

    #[test]
    fn test_bind_twice_reports_einval() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (_conn, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 17);

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777);
        handle_bind(&shared, &mut stack, sid, 17, addr);
        assert_eq!(read_retval(&mut shim), (0, 0));
        handle_bind(&shared, &mut stack, sid, 17, addr);
        assert_eq!(read_retval(&mut shim), (-1, Errno::EINVAL as i32));
    }

    #[test]
    fn test_listen_rekeys_to_replacement_pcb() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 17);
        handle_bind(
            &shared,
            &mut stack,
            sid,
            17,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777),
        );
        let _ = read_retval(&mut shim);

        handle_listen(&shared, &mut stack, sid, 17, 5);
        assert_eq!(read_retval(&mut shim), (0, 0));

        let replacement = stack
            .calls()
            .iter()
            .find_map(|c| match c {
                MockCall::Listen { replacement, .. } => Some(*replacement),
                _ => None,
            })
            .unwrap();
        let reg = shared.lock_registry();
        let conn = reg.conn(conn_id).unwrap();
        assert_eq!(conn.pcb, replacement);
        assert_eq!(conn.state, ConnState::Listen);
        assert!(!conn.read_interest);
        assert_eq!(reg.conn_by_pcb(replacement), Some(conn_id));
        assert!(stack.armed_accept(replacement));
        assert_eq!(stack.token(replacement), Some(conn_id.0));
    }

    #[test]
    fn test_connect_arms_callbacks_and_defers_reply() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 10);

        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80);
        handle_connect(&shared, &mut stack, sid, 10, addr);

        let reg = shared.lock_registry();
        let conn = reg.conn(conn_id).unwrap();
        assert_eq!(conn.state, ConnState::Connecting);
        assert!(conn.pending_reply);
        assert!(stack.armed_recv(conn.pcb));
        assert!(stack.armed_sent(conn.pcb));
        assert!(stack.armed_err(conn.pcb));
        assert!(stack.armed_connected(conn.pcb));
        assert_eq!(stack.poll_period(conn.pcb), Some(APPLICATION_POLL_FREQ));
    }

    #[test]
    fn test_connect_unknown_descriptor_is_dropped() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, shim) = client_session(&mut shared.lock_registry());

        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80);
        handle_connect(&shared, &mut stack, sid, 42, addr);

        // No connection context: nothing reaches the stack, no reply either.
        assert!(stack
            .calls()
            .iter()
            .all(|c| !matches!(c, MockCall::Connect { .. })));
        shim.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        let err = (&shim).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_connect_synchronous_failure_translates() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (_conn, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 10);

        stack.fail_connect = Some(StackError::Route);
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80);
        handle_connect(&shared, &mut stack, sid, 10, addr);
        assert_eq!(read_retval(&mut shim), (-1, Errno::ENETUNREACH as i32));
    }

    #[test]
    fn test_connected_event_reports_success() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 10);
        handle_connect(
            &shared,
            &mut stack,
            sid,
            10,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
        );

        dispatch_event(&shared, &mut stack, StackEvent::Connected { token: conn_id.0 });

        assert_eq!(read_retval(&mut shim), (0, 0));
        let reg = shared.lock_registry();
        assert_eq!(reg.conn(conn_id).unwrap().state, ConnState::Established);
        assert!(!reg.conn(conn_id).unwrap().pending_reply);
    }

    #[test]
    fn test_error_event_reports_and_closes() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 10);
        let pcb = shared.lock_registry().conn(conn_id).unwrap().pcb;

        dispatch_event(
            &shared,
            &mut stack,
            StackEvent::Error {
                token: conn_id.0,
                error: StackError::Timeout,
            },
        );

        assert_eq!(read_retval(&mut shim), (-1, Errno::ETIMEDOUT as i32));
        assert!(shared.lock_registry().conn(conn_id).is_none());
        assert!(!stack.is_open(pcb));
    }

    #[test]
    fn test_refused_connect_maps_to_econnrefused() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 10);

        dispatch_event(
            &shared,
            &mut stack,
            StackEvent::Error {
                token: conn_id.0,
                error: StackError::Abort,
            },
        );
        assert_eq!(read_retval(&mut shim), (-1, Errno::ECONNREFUSED as i32));
    }

    #[test]
    fn test_accept_event_builds_child_and_signals_shim() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, mut shim) = client_session(&mut shared.lock_registry());
        let (parent_id, parent_fd) = socket_and_map(&shared, &mut stack, sid, &shim, 17);
        handle_bind(
            &shared,
            &mut stack,
            sid,
            17,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777),
        );
        let _ = read_retval(&mut shim);
        handle_listen(&shared, &mut stack, sid, 17, 5);
        let _ = read_retval(&mut shim);
        let parent_pcb = shared.lock_registry().conn(parent_id).unwrap().pcb;

        let child_pcb = stack.new_pcb().unwrap();
        dispatch_event(
            &shared,
            &mut stack,
            StackEvent::Accept {
                parent: parent_id.0,
                child: child_pcb,
            },
        );

        // Sentinel byte on the parent's pair unblocks the accept stub.
        let mut sentinel = [0u8; 1];
        let mut parent_stream = UnixStream::from(parent_fd);
        parent_stream.read_exact(&mut sentinel).unwrap();
        assert_eq!(&sentinel, b"z");

        // Then the child descriptor arrives on the session.
        assert!(rpc::recv_fd(&shim).unwrap().is_some());

        let reg = shared.lock_registry();
        let child_id = reg.conn_by_pcb(child_pcb).expect("child registered");
        let child = reg.conn(child_id).unwrap();
        assert_eq!(child.state, ConnState::Established);
        assert!(child.pending_reply);
        assert_eq!(child.session, sid);
        assert!(stack.armed_recv(child_pcb));
        assert_eq!(stack.poll_period(child_pcb), Some(ACCEPTED_POLL_FREQ));
        assert!(stack
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Accepted(p) if *p == parent_pcb)));
    }

    #[test]
    fn test_duplicate_mapping_with_dead_pair_reaps_original() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, shim) = client_session(&mut shared.lock_registry());

        let (old_id, old_fd) = socket_and_map(&shared, &mut stack, sid, &shim, 9);
        drop(old_fd); // client closed its end; we never saw it

        handle_socket(&shared, &mut stack, sid);
        let _new_fd = rpc::recv_fd(&shim).unwrap().unwrap();
        handle_map(&shared, &mut stack, sid, 9);

        let reg = shared.lock_registry();
        assert!(reg.conn(old_id).is_none(), "stale mapping reaped");
        let survivor = reg.conn_by_peer_fd(sid, 9).unwrap();
        assert_ne!(survivor, old_id);
    }

    #[test]
    #[should_panic(expected = "two live connections")]
    fn test_duplicate_mapping_with_live_pair_is_fatal() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, shim) = client_session(&mut shared.lock_registry());

        let (_old_id, old_fd) = socket_and_map(&shared, &mut stack, sid, &shim, 9);

        handle_socket(&shared, &mut stack, sid);
        let _new_fd = rpc::recv_fd(&shim).unwrap().unwrap();
        handle_map(&shared, &mut stack, sid, 9);
        drop(old_fd);
    }

    #[test]
    fn test_session_close_closes_bound_connections_first() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (sid, shim) = client_session(&mut shared.lock_registry());
        let (conn_id, _fd) = socket_and_map(&shared, &mut stack, sid, &shim, 17);
        let pcb = shared.lock_registry().conn(conn_id).unwrap().pcb;

        close_session(&shared, &mut stack, sid);

        let reg = shared.lock_registry();
        assert_eq!(reg.conn_count(), 0);
        assert_eq!(reg.session_count(), 0);
        assert!(!stack.is_open(pcb));
        assert!(stack
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Close(p) if *p == pcb)));
    }

    #[test]
    fn test_errno_table() {
        assert_eq!(errno_for(StackError::Mem), Errno::ENOMEM as i32);
        assert_eq!(errno_for(StackError::Buf), Errno::ENOBUFS as i32);
        assert_eq!(errno_for(StackError::Timeout), Errno::ETIMEDOUT as i32);
        assert_eq!(errno_for(StackError::Route), Errno::ENETUNREACH as i32);
        assert_eq!(errno_for(StackError::InProgress), Errno::EINPROGRESS as i32);
        assert_eq!(errno_for(StackError::Val), Errno::EINVAL as i32);
        assert_eq!(errno_for(StackError::WouldBlock), Errno::EWOULDBLOCK as i32);
        assert_eq!(errno_for(StackError::Use), Errno::EADDRINUSE as i32);
        assert_eq!(errno_for(StackError::IsConn), Errno::EISCONN as i32);
        assert_eq!(errno_for(StackError::Abort), Errno::ECONNREFUSED as i32);
        assert_eq!(errno_for(StackError::Reset), -1);
        assert_eq!(errno_for(StackError::Arg), -1);
    }
}
