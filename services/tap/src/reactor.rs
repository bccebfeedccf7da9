//! Single-threaded reactor.
//!
//! One OS thread owns the readiness poll over the rendezvous listener, every
//! session endpoint, every watched connection `local_end`, and the wake
//! channel. Between polls it drives the stack's TCP and ARP timers; the poll
//! timeout is whatever is left of the nearer tick.

use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use netcon_stack::{ARP_TICK_MS, TCP_TICK_MS};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{info, warn};

use crate::registry::{ConnId, SessionId};
use crate::rpc;
use crate::{lifecycle, pump, TapShared};

#[derive(Clone, Copy)]
enum Slot {
    Wake,
    Listener,
    Session(SessionId),
    Conn(ConnId),
}

pub(crate) fn run(shared: Arc<TapShared>, listener: UnixListener) {
    info!(
        device = %shared.config.rendezvous_path().display(),
        "reactor running"
    );
    let mut last_tcp = Instant::now();
    let mut last_arp = Instant::now();

    while shared.run.load(Ordering::Acquire) {
        let now = Instant::now();
        let since_tcp = now.duration_since(last_tcp).as_millis() as u64;
        let since_arp = now.duration_since(last_arp).as_millis() as u64;
        let mut tcp_due = TCP_TICK_MS.saturating_sub(since_tcp);
        let mut arp_due = ARP_TICK_MS.saturating_sub(since_arp);
        if tcp_due == 0 {
            shared.with_stack(|stack| stack.tick_tcp());
            last_tcp = now;
            tcp_due = TCP_TICK_MS;
        }
        if arp_due == 0 {
            shared.with_stack(|stack| stack.tick_arp());
            last_arp = now;
            arp_due = ARP_TICK_MS;
        }

        // Snapshot the poll set under the registry lock. A descriptor closed
        // by the ingress thread between here and the poll at worst reports
        // POLLNVAL or a spurious wakeup; the handlers re-resolve by id.
        let mut slots: Vec<(Slot, RawFd)> = vec![
            (Slot::Wake, shared.wake_rx.as_raw_fd()),
            (Slot::Listener, listener.as_raw_fd()),
        ];
        {
            let reg = shared.lock_registry();
            for (sid, fd) in reg.poll_sessions() {
                slots.push((Slot::Session(sid), fd));
            }
            for (conn_id, fd) in reg.poll_conns() {
                slots.push((Slot::Conn(conn_id), fd));
            }
        }
        // SAFETY: the fd numbers were read from live streams above and
        // poll(2) only inspects them; a concurrent close makes the
        // entry report POLLNVAL, which is skipped.
        let borrowed: Vec<BorrowedFd> = slots
            .iter()
            .map(|&(_, fd)| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut pollfds: Vec<PollFd> = borrowed
            .iter()
            .map(|fd| PollFd::new(fd, PollFlags::POLLIN))
            .collect();

        let timeout_ms = tcp_due.min(arp_due).min(i32::MAX as u64) as i32;
        match poll(&mut pollfds, timeout_ms) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "poll failed");
                continue;
            }
        }

        let ready: Vec<(usize, PollFlags)> = pollfds
            .iter()
            .enumerate()
            .filter_map(|(i, pfd)| pfd.revents().filter(|r| !r.is_empty()).map(|r| (i, r)))
            .collect();
        drop(pollfds);

        for (idx, revents) in ready {
            if revents.contains(PollFlags::POLLNVAL) {
                continue;
            }
            match slots[idx].0 {
                Slot::Wake => drain_wake(&shared),
                Slot::Listener => accept_sessions(&shared, &listener),
                Slot::Session(sid) => service_session(&shared, sid, revents),
                Slot::Conn(conn_id) => {
                    shared.with_stack(|stack| pump::pump_tx(&shared, stack, conn_id))
                }
            }
        }
    }

    // Shutdown: flush every connection and session, then the rendezvous.
    shared.with_stack(|stack| {
        let sids = shared.lock_registry().session_ids();
        for sid in sids {
            lifecycle::close_session(&shared, stack, sid);
        }
    });
    let path = shared.config.rendezvous_path();
    drop(listener);
    let _ = std::fs::remove_file(&path);
    info!("reactor stopped");
}

fn drain_wake(shared: &TapShared) {
    let mut buf = [0u8; 64];
    loop {
        match (&shared.wake_rx).read(&mut buf) {
            Ok(n) if n == buf.len() => continue,
            _ => break,
        }
    }
}

fn accept_sessions(shared: &TapShared, listener: &UnixListener) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "unable to mark session non-blocking");
                    continue;
                }
                let sid = shared.lock_registry().add_session(stream);
                shared
                    .stats
                    .sessions_accepted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(%sid, "rpc session accepted");
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "rendezvous accept failed");
                break;
            }
        }
    }
}

/// Pull everything readable off a session, dispatch complete requests, and
/// tear the session down on EOF or transport error.
fn service_session(shared: &TapShared, sid: SessionId, revents: PollFlags) {
    let mut requests = Vec::new();
    let mut dead = revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR);
    {
        let mut reg = shared.lock_registry();
        let Some(session) = reg.session_mut(sid) else {
            return;
        };
        if revents.contains(PollFlags::POLLIN) {
            let mut chunk = [0u8; 4096];
            loop {
                match session.stream.read(&mut chunk) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => session.rx.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(%sid, error = %e, "session read failed");
                        dead = true;
                        break;
                    }
                }
            }
        }
        session.last_activity = Instant::now();

        let mut consumed = 0;
        loop {
            match rpc::parse_request(&session.rx[consumed..]) {
                Ok(Some((request, n))) => {
                    requests.push(request);
                    consumed += n;
                }
                Ok(None) => break,
                Err(e) => {
                    // Unknown opcode: no way to resync mid-stream, drop what
                    // is buffered and keep the session.
                    warn!(%sid, error = %e, "protocol error, dropping buffered bytes");
                    consumed = session.rx.len();
                    break;
                }
            }
        }
        session.rx.drain(..consumed);
    }

    for request in requests {
        shared.with_stack(|stack| lifecycle::handle_request(shared, stack, sid, request));
    }
    if dead {
        shared.with_stack(|stack| lifecycle::close_session(shared, stack, sid));
    }
}
