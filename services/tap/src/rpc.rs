//! RPC wire protocol between the interception shim and the tap.
//!
//! Requests are a 1-byte opcode followed by a fixed-layout payload;
//! multi-byte integer fields are host-endian (the shim runs on the same
//! machine), except the `sockaddr_in` port and address which stay in network
//! order as the shim captured them. Replies are either a 9-byte `RETVAL`
//! record or a descriptor message: one marker byte carrying the descriptor
//! as `SCM_RIGHTS` ancillary data. A descriptor message *without* ancillary
//! payload means "no descriptor" (the shim reads it as `-1`).
//!
//! Both directions of the format live here — the demuxer the tap uses and
//! the encoders the shim (and the tests standing in for it) uses.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;

/// Create a socket (PCB + stream pair).
pub const RPC_SOCKET: u8 = 0x01;
/// Move a socket to the listening state.
pub const RPC_LISTEN: u8 = 0x02;
/// Bind a socket to a local port.
pub const RPC_BIND: u8 = 0x03;
/// Start an asynchronous connect.
pub const RPC_CONNECT: u8 = 0x04;
/// Complete a mapping started by SOCKET or an accept.
pub const RPC_MAP: u8 = 0x05;
/// Ask whether a descriptor belongs to the tap.
pub const RPC_MAP_REQ: u8 = 0x06;
/// Reply record tag (tap to shim).
pub const RPC_RETVAL: u8 = 0x07;

/// Length of a `RETVAL` record: tag, retval, errno.
pub const RETVAL_LEN: usize = 9;

const AF_INET: u16 = 2;
const SOCKADDR_IN_LEN: usize = 16;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    Socket {
        domain: i32,
        sock_type: i32,
        protocol: i32,
    },
    Listen {
        sockfd: i32,
        backlog: i32,
    },
    Bind {
        sockfd: i32,
        addr: SocketAddrV4,
    },
    Connect {
        sockfd: i32,
        addr: SocketAddrV4,
    },
    Map {
        fd: i32,
    },
    MapRequest {
        fd: i32,
    },
}

/// Protocol violations the demuxer cannot recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

fn payload_len(opcode: u8) -> Result<usize, WireError> {
    match opcode {
        RPC_SOCKET => Ok(12),
        RPC_LISTEN => Ok(8),
        RPC_BIND | RPC_CONNECT => Ok(4 + SOCKADDR_IN_LEN + 4),
        RPC_MAP | RPC_MAP_REQ => Ok(4),
        other => Err(WireError::UnknownOpcode(other)),
    }
}

fn read_i32(buf: &[u8]) -> i32 {
    i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_sockaddr_in(buf: &[u8]) -> SocketAddrV4 {
    // sin_family(2) | sin_port(2, network order) | sin_addr(4) | pad(8)
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    SocketAddrV4::new(ip, port)
}

/// Decode one request from the front of `buf`.
///
/// Returns `None` while the message is still incomplete, otherwise the
/// request plus the number of bytes it consumed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(RpcRequest, usize)>, WireError> {
    let Some(&opcode) = buf.first() else {
        return Ok(None);
    };
    let len = payload_len(opcode)?;
    if buf.len() < 1 + len {
        return Ok(None);
    }
    let p = &buf[1..1 + len];
    let request = match opcode {
        RPC_SOCKET => RpcRequest::Socket {
            domain: read_i32(&p[0..]),
            sock_type: read_i32(&p[4..]),
            protocol: read_i32(&p[8..]),
        },
        RPC_LISTEN => RpcRequest::Listen {
            sockfd: read_i32(&p[0..]),
            backlog: read_i32(&p[4..]),
        },
        RPC_BIND => RpcRequest::Bind {
            sockfd: read_i32(&p[0..]),
            addr: read_sockaddr_in(&p[4..]),
        },
        RPC_CONNECT => RpcRequest::Connect {
            sockfd: read_i32(&p[0..]),
            addr: read_sockaddr_in(&p[4..]),
        },
        RPC_MAP => RpcRequest::Map {
            fd: read_i32(&p[0..]),
        },
        RPC_MAP_REQ => RpcRequest::MapRequest {
            fd: read_i32(&p[0..]),
        },
        _ => unreachable!("payload_len rejected the opcode"),
    };
    Ok(Some((request, 1 + len)))
}

// ============================================================================
// Encoders (shim side, and RETVAL in both directions)
// ============================================================================

fn put_sockaddr_in(out: &mut Vec<u8>, addr: &SocketAddrV4) {
    out.extend_from_slice(&AF_INET.to_ne_bytes());
    out.extend_from_slice(&addr.port().to_be_bytes());
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&[0u8; 8]);
}

pub fn encode_socket(domain: i32, sock_type: i32, protocol: i32) -> Vec<u8> {
    let mut out = vec![RPC_SOCKET];
    out.extend_from_slice(&domain.to_ne_bytes());
    out.extend_from_slice(&sock_type.to_ne_bytes());
    out.extend_from_slice(&protocol.to_ne_bytes());
    out
}

pub fn encode_listen(sockfd: i32, backlog: i32) -> Vec<u8> {
    let mut out = vec![RPC_LISTEN];
    out.extend_from_slice(&sockfd.to_ne_bytes());
    out.extend_from_slice(&backlog.to_ne_bytes());
    out
}

pub fn encode_bind(sockfd: i32, addr: &SocketAddrV4) -> Vec<u8> {
    let mut out = vec![RPC_BIND];
    out.extend_from_slice(&sockfd.to_ne_bytes());
    put_sockaddr_in(&mut out, addr);
    out.extend_from_slice(&(SOCKADDR_IN_LEN as u32).to_ne_bytes());
    out
}

pub fn encode_connect(sockfd: i32, addr: &SocketAddrV4) -> Vec<u8> {
    let mut out = vec![RPC_CONNECT];
    out.extend_from_slice(&sockfd.to_ne_bytes());
    put_sockaddr_in(&mut out, addr);
    out.extend_from_slice(&(SOCKADDR_IN_LEN as u32).to_ne_bytes());
    out
}

pub fn encode_map(fd: i32) -> Vec<u8> {
    let mut out = vec![RPC_MAP];
    out.extend_from_slice(&fd.to_ne_bytes());
    out
}

pub fn encode_map_request(fd: i32) -> Vec<u8> {
    let mut out = vec![RPC_MAP_REQ];
    out.extend_from_slice(&fd.to_ne_bytes());
    out
}

pub fn encode_retval(retval: i32, errno: i32) -> [u8; RETVAL_LEN] {
    let mut out = [0u8; RETVAL_LEN];
    out[0] = RPC_RETVAL;
    out[1..5].copy_from_slice(&retval.to_ne_bytes());
    out[5..9].copy_from_slice(&errno.to_ne_bytes());
    out
}

/// Decode a `RETVAL` record (shim side).
pub fn parse_retval(buf: &[u8]) -> Option<(i32, i32)> {
    if buf.len() < RETVAL_LEN || buf[0] != RPC_RETVAL {
        return None;
    }
    Some((read_i32(&buf[1..]), read_i32(&buf[5..])))
}

// ============================================================================
// Descriptor passing
// ============================================================================

/// Send a descriptor message: one marker byte, with `fd` attached as
/// `SCM_RIGHTS` when present.
pub fn send_fd(stream: &UnixStream, fd: Option<RawFd>) -> io::Result<()> {
    let marker = [0u8];
    let iov = [io::IoSlice::new(&marker)];
    match fd {
        Some(raw) => {
            let fds = [raw];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        }
        None => sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::empty(), None),
    }
    .map_err(io::Error::from)?;
    Ok(())
}

/// Receive a descriptor message (shim side). Blocks per the stream's mode.
pub fn recv_fd(stream: &UnixStream) -> io::Result<Option<OwnedFd>> {
    let mut marker = [0u8; 1];
    let mut iov = [io::IoSliceMut::new(&mut marker)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;
    if msg.bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "descriptor channel closed",
        ));
    }
    let mut received = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for (i, &raw) in fds.iter().enumerate() {
                if i == 0 && received.is_none() {
                    received = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                } else {
                    // Never expected; close rather than leak.
                    drop(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
    }
    Ok(received)
}
