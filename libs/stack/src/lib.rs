//! Userspace TCP/IP stack facade.
//!
//! The netcon tap terminates client socket calls against an embedded
//! userspace TCP/IP stack. This crate owns the seam between the two: the
//! [`TcpIpStack`] trait is the complete contract the tap programs against,
//! and [`SmoltcpStack`] is the production implementation on top of the
//! `smoltcp` stack. A scriptable [`MockStack`] is provided for tests and
//! development, mirroring how the node agent abstracts its VM runtime.
//!
//! ## Callback model
//!
//! The stack surfaces asynchronous activity (accepted connections, delivered
//! payload, send acknowledgements, connect completion, failures) as
//! [`StackEvent`]s on an internal queue. The holder of the stack lock drains
//! the queue with [`TcpIpStack::take_events`] and dispatches every event
//! *before releasing the lock*, so event handlers always run under the same
//! lock that protects the stack — and may freely call back into it through
//! the `&mut` they were handed.
//!
//! Per-connection events are keyed by a caller-supplied 64-bit token
//! ([`TcpIpStack::set_conn_token`]), not by anything whose validity depends
//! on the caller's storage layout. A stale token resolves to nothing and the
//! event is dropped.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

mod error;
mod mock;
mod smol;

pub use error::StackError;
pub use mock::{MockCall, MockStack};
pub use smol::SmoltcpStack;

/// TCP housekeeping cadence, in milliseconds.
pub const TCP_TICK_MS: u64 = 10;

/// ARP housekeeping cadence, in milliseconds.
pub const ARP_TICK_MS: u64 = 5_000;

/// Cadence of the tap's status/stats heartbeat, in milliseconds.
pub const STATUS_TICK_MS: u64 = 500;

/// Per-connection poll period for client-initiated connects, in half-seconds.
pub const APPLICATION_POLL_FREQ: u8 = 20;

/// Per-connection poll period for accepted connections, in half-seconds.
pub const ACCEPTED_POLL_FREQ: u8 = 1;

/// Stack-side send buffer per connection. Also bounds the tap's staging
/// buffer for client bytes not yet accepted by the stack.
pub const TCP_SND_BUF: usize = 64 * 1024;

/// Stack-side receive buffer per connection.
pub const TCP_RCV_BUF: usize = 64 * 1024;

/// Inbound frame queue depth; frames past this are dropped, never queued.
pub const FRAME_POOL_CAP: usize = 128;

// ============================================================================
// Addressing
// ============================================================================

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// Read a MAC from the first six bytes of `buf`.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = buf.get(..6)?.try_into().ok()?;
        Some(Mac(octets))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for Mac {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = 0;
        for (i, part) in s.split(':').enumerate() {
            if i >= 6 {
                return Err(StackError::Val);
            }
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| StackError::Val)?;
            parts += 1;
        }
        if parts != 6 {
            return Err(StackError::Val);
        }
        Ok(Mac(octets))
    }
}

/// Opaque handle to a protocol control block inside the stack.
///
/// Handles are never reused within the lifetime of a stack instance; an
/// operation on a dead handle fails with [`StackError::Arg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pcb(pub(crate) u64);

impl fmt::Display for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcb#{}", self.0)
    }
}

/// Virtual interface configuration handed to [`TcpIpStack::add_interface`].
#[derive(Debug, Clone)]
pub struct InterfaceConf {
    /// Interface IPv4 address.
    pub ip: Ipv4Addr,
    /// Prefix length of the interface address.
    pub prefix_len: u8,
    /// Default gateway.
    pub gateway: Ipv4Addr,
    /// Interface hardware address.
    pub mac: Mac,
    /// Interface MTU (Ethernet payload, excluding the 14-byte header).
    pub mtu: usize,
}

/// Transmit hook for stack egress. Invoked with a complete Ethernet frame
/// while the stack lock is held; it must not block.
pub type LinkOutFn = Box<dyn FnMut(&[u8]) + Send>;

// ============================================================================
// Events
// ============================================================================

/// Asynchronous stack activity, drained via [`TcpIpStack::take_events`].
///
/// `token` is the value installed with [`TcpIpStack::set_conn_token`]; events
/// for connections without a token carry `0`.
#[derive(Debug)]
pub enum StackEvent {
    /// A listener accepted a new connection. `child` is a fresh stream PCB;
    /// the receiver owns it and must either adopt or close it.
    Accept { parent: u64, child: Pcb },
    /// Payload delivered by the remote peer, in arrival order.
    Recv { token: u64, data: Vec<u8> },
    /// The remote peer closed its half of the connection and all delivered
    /// payload has already been surfaced.
    RemoteClose { token: u64 },
    /// The stack acknowledged `len` previously written bytes; send-buffer
    /// space has opened up.
    Sent { token: u64, len: usize },
    /// An asynchronous connect completed successfully.
    Connected { token: u64 },
    /// The connection failed. The PCB is already dead; closing it again is
    /// tolerated and reports [`StackError::Arg`].
    Error { token: u64, error: StackError },
    /// Per-connection poll timer, at the period set with
    /// [`TcpIpStack::on_poll`].
    Poll { token: u64 },
}

// ============================================================================
// Facade contract
// ============================================================================

/// Facade over a userspace TCP/IP stack.
///
/// Every method must be called with the caller's stack lock held; the trait
/// itself performs no locking. Operations are non-blocking.
pub trait TcpIpStack: Send {
    /// Install the virtual network interface. One interface per stack;
    /// calling twice fails with [`StackError::Val`].
    fn add_interface(&mut self, conf: &InterfaceConf, link_out: LinkOutFn)
        -> Result<(), StackError>;

    /// Feed one inbound Ethernet frame to the stack. Fails with
    /// [`StackError::Buf`] when the frame pool is exhausted (the caller drops
    /// the frame) and [`StackError::Interface`] before `add_interface`.
    fn input_frame(&mut self, frame: &[u8]) -> Result<(), StackError>;

    /// Drive TCP housekeeping. Call at least every [`TCP_TICK_MS`].
    fn tick_tcp(&mut self);

    /// Drive ARP housekeeping. Call at least every [`ARP_TICK_MS`].
    fn tick_arp(&mut self);

    /// Drain pending events. The caller dispatches them before releasing the
    /// stack lock, looping until the queue is empty.
    fn take_events(&mut self) -> Vec<StackEvent>;

    /// Allocate a new connection PCB.
    fn new_pcb(&mut self) -> Result<Pcb, StackError>;

    /// Bind a PCB to a local address. Fails with [`StackError::Use`] when the
    /// port is taken.
    fn bind(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError>;

    /// Move a bound PCB to the listening state with the given backlog.
    /// Returns a *replacement* PCB; the argument PCB is consumed and the
    /// caller must re-key anything indexed by it.
    fn listen(&mut self, pcb: Pcb, backlog: usize) -> Result<Pcb, StackError>;

    /// Tell the listener it may queue another incoming connection, after the
    /// caller finished adopting an [`StackEvent::Accept`] child.
    fn accepted(&mut self, pcb: Pcb);

    /// Start an asynchronous connect. Success means the SYN was enqueued;
    /// completion arrives as [`StackEvent::Connected`] or
    /// [`StackEvent::Error`].
    fn connect(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError>;

    /// Enqueue payload for transmission. The data is copied into the stack's
    /// send buffer; the number of bytes accepted is returned and may be short.
    fn write(&mut self, pcb: Pcb, data: &[u8]) -> Result<usize, StackError>;

    /// Push enqueued payload toward the wire.
    fn output(&mut self, pcb: Pcb) -> Result<(), StackError>;

    /// Bytes of send-buffer space currently available on `pcb`. Zero for
    /// listeners and dead handles.
    fn snd_buf(&mut self, pcb: Pcb) -> usize;

    /// Acknowledge `len` bytes of delivered payload so the receive window
    /// reopens. Backends that free window space on delivery treat this as a
    /// no-op.
    fn recved(&mut self, pcb: Pcb, len: usize);

    /// Close a PCB. Streams are closed gracefully (FIN); listeners drop their
    /// accept queue. The handle is dead afterwards.
    fn close(&mut self, pcb: Pcb) -> Result<(), StackError>;

    /// Install (or clear) the 64-bit token carried by events for this PCB.
    fn set_conn_token(&mut self, pcb: Pcb, token: Option<u64>);

    /// Arm or disarm [`StackEvent::Accept`] emission for a listener.
    fn on_accept(&mut self, pcb: Pcb, enabled: bool);

    /// Arm or disarm [`StackEvent::Recv`]/[`StackEvent::RemoteClose`]
    /// emission. While disarmed, delivered payload stays in the stack's
    /// receive buffer and closes the peer's window.
    fn on_recv(&mut self, pcb: Pcb, enabled: bool);

    /// Arm or disarm [`StackEvent::Sent`] emission.
    fn on_sent(&mut self, pcb: Pcb, enabled: bool);

    /// Arm or disarm [`StackEvent::Error`] emission.
    fn on_err(&mut self, pcb: Pcb, enabled: bool);

    /// Arm or disarm [`StackEvent::Connected`] emission.
    fn on_connected(&mut self, pcb: Pcb, enabled: bool);

    /// Set the [`StackEvent::Poll`] period in half-seconds, or disable it.
    fn on_poll(&mut self, pcb: Pcb, half_secs: Option<u8>);
}
