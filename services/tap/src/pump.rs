//! Data pump between client stream pairs and stack connections.
//!
//! Client→stack moves bytes from a connection's `local_end` into the stack
//! under send-buffer flow control; stack→client forwards delivered payload
//! into `local_end` and acknowledges what actually fit. Backpressure in both
//! directions is expressed by toggling read interest on `local_end`: off
//! when the stack cannot take more, back on when the stack acknowledges
//! sent bytes.
//!
//! Every function here runs with the stack lock held by the caller.

use std::io::{Read, Write};

use netcon_stack::{TcpIpStack, TCP_SND_BUF};
use tracing::{debug, trace, warn};

use crate::lifecycle;
use crate::registry::{ConnId, ConnState};
use crate::TapShared;

/// Client → stack. Called when `local_end` turns readable.
pub(crate) fn pump_tx(shared: &TapShared, stack: &mut dyn TcpIpStack, conn_id: ConnId) {
    let mut reg = shared.lock_registry();
    let Some(conn) = reg.conn_mut(conn_id) else {
        return;
    };
    if conn.state == ConnState::Listen {
        return;
    }

    // Staging buffer full: stop watching until the stack drains.
    if conn.tx_buf.len() >= TCP_SND_BUF {
        conn.read_interest = false;
        return;
    }

    // Stack send buffer full: stop watching until a send is acknowledged.
    let snd_buf = stack.snd_buf(conn.pcb);
    if snd_buf == 0 {
        conn.read_interest = false;
        return;
    }

    let want = snd_buf.min(TCP_SND_BUF - conn.tx_buf.len());
    let mut chunk = vec![0u8; want];
    let read = match conn.local_end.read(&mut chunk) {
        Ok(0) => {
            drop(reg);
            lifecycle::close_conn(shared, stack, conn_id, "client closed its endpoint");
            return;
        }
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
        Err(e) => {
            drop(reg);
            warn!(%conn_id, error = %e, "client endpoint read failed");
            lifecycle::close_conn(shared, stack, conn_id, "client endpoint error");
            return;
        }
    };
    conn.tx_buf.extend_from_slice(&chunk[..read]);

    // Write from the front of the staging buffer: a failed write on a
    // previous round leaves bytes staged ahead of the chunk just read.
    let pcb = conn.pcb;
    let n = snd_buf.min(conn.tx_buf.len());
    match stack.write(pcb, &conn.tx_buf[..n]) {
        Ok(written) => {
            conn.tx_buf.drain(..written);
            let _ = stack.output(pcb);
            trace!(%conn_id, written, staged = conn.tx_buf.len(), "pumped client bytes");
        }
        Err(e) => {
            debug!(%conn_id, error = %e, "stack rejected write, keeping bytes staged");
        }
    }
}

/// Retry staged bytes that a previous write could not hand to the stack.
/// Driven by the per-connection poll timer.
pub(crate) fn pump_buffered(shared: &TapShared, stack: &mut dyn TcpIpStack, conn_id: ConnId) {
    let mut reg = shared.lock_registry();
    let Some(conn) = reg.conn_mut(conn_id) else {
        return;
    };
    if conn.tx_buf.is_empty() {
        return;
    }
    let pcb = conn.pcb;
    let n = stack.snd_buf(pcb).min(conn.tx_buf.len());
    if n == 0 {
        return;
    }
    if let Ok(written) = stack.write(pcb, &conn.tx_buf[..n]) {
        conn.tx_buf.drain(..written);
        let _ = stack.output(pcb);
        trace!(%conn_id, written, "drained staged bytes");
    }
}

/// Stack → client: forward delivered payload, acknowledge what fit.
/// Whatever does not fit in the kernel pipe is dropped; the shim is expected
/// to keep up.
pub(crate) fn handle_recv(
    shared: &TapShared,
    stack: &mut dyn TcpIpStack,
    conn_id: ConnId,
    data: &[u8],
) {
    let mut reg = shared.lock_registry();
    let Some(conn) = reg.conn_mut(conn_id) else {
        return;
    };
    let pcb = conn.pcb;
    match conn.local_end.write(data) {
        Ok(written) => {
            if written < data.len() {
                warn!(
                    %conn_id,
                    dropped = data.len() - written,
                    "short write to client endpoint, dropping tail"
                );
            }
            if written > 0 {
                stack.recved(pcb, written);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            warn!(%conn_id, dropped = data.len(), "client endpoint full, dropping payload");
        }
        Err(e) => {
            drop(reg);
            warn!(%conn_id, error = %e, "client endpoint write failed");
            lifecycle::close_conn(shared, stack, conn_id, "client endpoint error");
        }
    }
}

/// Send acknowledgement: stack buffer space opened, resume watching the
/// client endpoint and kick the reactor so its poll set refreshes.
pub(crate) fn handle_sent(shared: &TapShared, conn_id: ConnId) {
    let mut reg = shared.lock_registry();
    let Some(conn) = reg.conn_mut(conn_id) else {
        return;
    };
    if !conn.read_interest {
        conn.read_interest = true;
        drop(reg);
        shared.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnState;
    use crate::test_shared;
    use netcon_stack::{MockStack, StackError};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    /// Install one established connection; returns (conn id, client end, pcb).
    fn established(
        shared: &crate::TapShared,
        stack: &mut MockStack,
    ) -> (ConnId, UnixStream, netcon_stack::Pcb) {
        let pcb = stack.new_pcb().unwrap();
        let (local_end, client_end) = UnixStream::pair().unwrap();
        local_end.set_nonblocking(true).unwrap();
        let mut reg = shared.lock_registry();
        let (session_stream, _keep) = UnixStream::pair().unwrap();
        let sid = reg.add_session(session_stream);
        let id = reg.add_conn(pcb, sid, local_end).unwrap();
        reg.conn_mut(id).unwrap().state = ConnState::Established;
        (id, client_end, pcb)
    }

    #[test]
    fn test_pump_moves_client_bytes_to_stack() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, mut client, pcb) = established(&shared, &mut stack);

        client.write_all(b"hello stack").unwrap();
        pump_tx(&shared, &mut stack, id);

        assert_eq!(stack.written(pcb), b"hello stack");
        let reg = shared.lock_registry();
        let conn = reg.conn(id).unwrap();
        assert!(conn.tx_buf.is_empty());
        assert!(conn.read_interest);
    }

    #[test]
    fn test_pump_respects_snd_buf_window() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, mut client, pcb) = established(&shared, &mut stack);

        stack.set_snd_buf(pcb, 4);
        client.write_all(b"0123456789").unwrap();
        pump_tx(&shared, &mut stack, id);
        assert_eq!(stack.written(pcb), b"0123");

        stack.set_snd_buf(pcb, 64);
        pump_tx(&shared, &mut stack, id);
        assert_eq!(stack.written(pcb), b"0123456789");
    }

    #[test]
    fn test_zero_window_disables_read_interest() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, mut client, pcb) = established(&shared, &mut stack);

        stack.set_snd_buf(pcb, 0);
        client.write_all(b"stalled").unwrap();
        pump_tx(&shared, &mut stack, id);

        let reg = shared.lock_registry();
        assert!(!reg.conn(id).unwrap().read_interest);
        assert!(stack.written(pcb).is_empty());
    }

    #[test]
    fn test_full_staging_buffer_disables_read_interest() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, _client, _pcb) = established(&shared, &mut stack);

        shared.lock_registry().conn_mut(id).unwrap().tx_buf = vec![0u8; TCP_SND_BUF];
        pump_tx(&shared, &mut stack, id);
        assert!(!shared.lock_registry().conn(id).unwrap().read_interest);
    }

    #[test]
    fn test_failed_write_keeps_bytes_staged() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, mut client, pcb) = established(&shared, &mut stack);

        stack.fail_write = Some(StackError::Mem);
        client.write_all(b"keep me").unwrap();
        pump_tx(&shared, &mut stack, id);

        assert_eq!(shared.lock_registry().conn(id).unwrap().tx_buf, b"keep me");

        stack.fail_write = None;
        pump_buffered(&shared, &mut stack, id);
        assert_eq!(stack.written(pcb), b"keep me");
        assert!(shared.lock_registry().conn(id).unwrap().tx_buf.is_empty());
    }

    #[test]
    fn test_staged_bytes_flush_in_order_before_new_reads() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, mut client, pcb) = established(&shared, &mut stack);

        stack.fail_write = Some(StackError::Mem);
        client.write_all(b"first ").unwrap();
        pump_tx(&shared, &mut stack, id);
        assert_eq!(shared.lock_registry().conn(id).unwrap().tx_buf, b"first ");

        // Recovery through the readable path must drain the staged prefix
        // ahead of the freshly-read bytes.
        stack.fail_write = None;
        client.write_all(b"second").unwrap();
        pump_tx(&shared, &mut stack, id);

        assert_eq!(stack.written(pcb), b"first second");
        assert!(shared.lock_registry().conn(id).unwrap().tx_buf.is_empty());
    }

    #[test]
    fn test_client_eof_closes_connection() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, client, pcb) = established(&shared, &mut stack);

        drop(client);
        pump_tx(&shared, &mut stack, id);

        assert!(shared.lock_registry().conn(id).is_none());
        assert!(!stack.is_open(pcb));
    }

    #[test]
    fn test_recv_forwards_and_acknowledges() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, mut client, pcb) = established(&shared, &mut stack);

        handle_recv(&shared, &mut stack, id, b"payload in");
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"payload in");
        assert_eq!(stack.recved_total(pcb), 10);
    }

    #[test]
    fn test_sent_reenables_read_interest_and_wakes() {
        let shared = test_shared();
        let mut stack = MockStack::new();
        let (id, _client, _pcb) = established(&shared, &mut stack);

        shared.lock_registry().conn_mut(id).unwrap().read_interest = false;
        handle_sent(&shared, id);

        assert!(shared.lock_registry().conn(id).unwrap().read_interest);
        let mut byte = [0u8; 8];
        let n = (&shared.wake_rx).read(&mut byte).unwrap();
        assert!(n >= 1);
    }
}
