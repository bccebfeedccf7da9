//! Stack error taxonomy.
//!
//! The variants mirror the error surface of classic userspace TCP/IP stacks;
//! the tap translates them to client-visible errno values at its RPC edge.

use thiserror::Error;

/// Errors reported by a [`TcpIpStack`](crate::TcpIpStack) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    /// Out of memory.
    #[error("out of memory")]
    Mem,

    /// Buffer space unavailable.
    #[error("buffer space unavailable")]
    Buf,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// No route to host.
    #[error("no route to host")]
    Route,

    /// Operation in progress.
    #[error("operation in progress")]
    InProgress,

    /// Illegal value.
    #[error("illegal value")]
    Val,

    /// Operation would block.
    #[error("operation would block")]
    WouldBlock,

    /// Address in use.
    #[error("address in use")]
    Use,

    /// Connection already established.
    #[error("already connected")]
    IsConn,

    /// Connection aborted (e.g. refused by the peer).
    #[error("connection aborted")]
    Abort,

    /// Connection reset by the peer.
    #[error("connection reset")]
    Reset,

    /// Connection closed.
    #[error("connection closed")]
    Closed,

    /// Not connected.
    #[error("not connected")]
    Conn,

    /// Illegal argument, including operations on dead PCB handles.
    #[error("illegal argument")]
    Arg,

    /// Low-level interface error, including use before an interface exists.
    #[error("interface error")]
    Interface,
}
