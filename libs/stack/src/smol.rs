//! smoltcp-backed implementation of the stack facade.
//!
//! The stack runs entirely in process memory: inbound Ethernet frames are
//! queued on a bounded virtual device, `smoltcp` consumes them during polls,
//! and egress frames are handed to the registered link-out hook. Socket
//! activity observed across polls is converted into [`StackEvent`]s.
//!
//! Listener backlog is modeled as a pool of listening sockets per listener
//! PCB: when one of them completes a handshake it is adopted as a fresh
//! stream PCB and surfaced as [`StackEvent::Accept`]; `accepted()` refills
//! the pool slot.
//!
//! One known flattening: a reset arriving on an *established* connection
//! surfaces as [`StackEvent::RemoteClose`] rather than a distinct error,
//! because the socket API does not expose the teardown reason. A reset
//! answering a connect attempt is reported as [`StackError::Abort`].

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Instant as StdInstant;

use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{
    ConnectError, ListenError, Socket as TcpSocket, SocketBuffer, State as TcpState,
};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr};
use tracing::{debug, trace, warn};

use crate::{
    InterfaceConf, LinkOutFn, Pcb, StackError, StackEvent, TcpIpStack, FRAME_POOL_CAP,
    TCP_RCV_BUF, TCP_SND_BUF,
};

const ETHERNET_HEADER_LEN: usize = 14;
const EPHEMERAL_FIRST: u16 = 49152;
const MAX_BACKLOG: usize = 16;
const RECV_CHUNK: usize = 4096;
const RANDOM_SEED: u64 = 0x6e63_7430_5f73_6565;

// ============================================================================
// Virtual device
// ============================================================================

/// Bounded in-memory Ethernet device bridging the overlay and smoltcp.
struct BridgeDevice {
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
    mtu: usize,
}

impl BridgeDevice {
    fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            mtu: 1500 + ETHERNET_HEADER_LEN,
        }
    }

    /// Queue an inbound frame; `false` means the pool is full.
    fn push_rx(&mut self, frame: Vec<u8>) -> bool {
        if self.rx.len() >= FRAME_POOL_CAP {
            return false;
        }
        self.rx.push_back(frame);
        true
    }

    fn drain_tx(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.tx)
    }
}

struct BridgeRxToken(Vec<u8>);

impl RxToken for BridgeRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct BridgeTxToken<'a>(&'a mut Vec<Vec<u8>>);

impl<'a> TxToken for BridgeTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.push(frame);
        result
    }
}

impl Device for BridgeDevice {
    type RxToken<'a> = BridgeRxToken where Self: 'a;
    type TxToken<'a> = BridgeTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((BridgeRxToken(frame), BridgeTxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(BridgeTxToken(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

// ============================================================================
// PCB bookkeeping
// ============================================================================

struct StreamPcb {
    handle: SocketHandle,
    token: Option<u64>,
    local_port: Option<u16>,
    owns_port: bool,
    connecting: bool,
    was_established: bool,
    eof_emitted: bool,
    last_send_queue: usize,
    want_recv: bool,
    want_sent: bool,
    want_err: bool,
    want_connected: bool,
    poll_half_secs: Option<u8>,
    last_poll_ms: u64,
}

impl StreamPcb {
    fn new(handle: SocketHandle) -> Self {
        Self {
            handle,
            token: None,
            local_port: None,
            owns_port: false,
            connecting: false,
            was_established: false,
            eof_emitted: false,
            last_send_queue: 0,
            want_recv: false,
            want_sent: false,
            want_err: false,
            want_connected: false,
            poll_half_secs: None,
            last_poll_ms: 0,
        }
    }

    fn adopted(handle: SocketHandle, send_queue: usize) -> Self {
        Self {
            was_established: true,
            last_send_queue: send_queue,
            ..Self::new(handle)
        }
    }
}

struct ListenerPcb {
    token: Option<u64>,
    port: u16,
    backlog: usize,
    slots: Vec<SocketHandle>,
    accept_enabled: bool,
}

enum PcbEntry {
    Stream(StreamPcb),
    Listener(ListenerPcb),
}

// ============================================================================
// Stack
// ============================================================================

/// Production [`TcpIpStack`] on top of `smoltcp`.
pub struct SmoltcpStack {
    device: BridgeDevice,
    iface: Option<Interface>,
    sockets: SocketSet<'static>,
    link_out: Option<LinkOutFn>,
    pcbs: HashMap<Pcb, PcbEntry>,
    next_pcb: u64,
    next_ephemeral: u16,
    bound: HashMap<u16, Pcb>,
    events: VecDeque<StackEvent>,
    graveyard: Vec<SocketHandle>,
    epoch: StdInstant,
}

impl SmoltcpStack {
    pub fn new() -> Self {
        Self {
            device: BridgeDevice::new(),
            iface: None,
            sockets: SocketSet::new(Vec::new()),
            link_out: None,
            pcbs: HashMap::new(),
            next_pcb: 1,
            next_ephemeral: EPHEMERAL_FIRST,
            bound: HashMap::new(),
            events: VecDeque::new(),
            graveyard: Vec::new(),
            epoch: StdInstant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn now(&self) -> SmolInstant {
        SmolInstant::from_millis(self.now_ms() as i64)
    }

    fn new_socket() -> TcpSocket<'static> {
        TcpSocket::new(
            SocketBuffer::new(vec![0u8; TCP_RCV_BUF]),
            SocketBuffer::new(vec![0u8; TCP_SND_BUF]),
        )
    }

    fn stream_mut(&mut self, pcb: Pcb) -> Result<&mut StreamPcb, StackError> {
        match self.pcbs.get_mut(&pcb) {
            Some(PcbEntry::Stream(st)) => Ok(st),
            _ => Err(StackError::Arg),
        }
    }

    fn alloc_pcb_id(&mut self) -> Pcb {
        let pcb = Pcb(self.next_pcb);
        self.next_pcb += 1;
        pcb
    }

    fn alloc_ephemeral(&mut self) -> u16 {
        loop {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_FIRST
            } else {
                port + 1
            };
            if !self.bound.contains_key(&port) {
                return port;
            }
        }
    }

    fn spawn_listen_slot(
        sockets: &mut SocketSet<'static>,
        port: u16,
    ) -> Result<SocketHandle, StackError> {
        let mut socket = Self::new_socket();
        socket.listen(port).map_err(|e| match e {
            ListenError::InvalidState => StackError::Val,
            ListenError::Unaddressable => StackError::Val,
        })?;
        Ok(sockets.add(socket))
    }

    /// One full poll round: run smoltcp, flush egress, derive events.
    fn poll_and_scan(&mut self) {
        let now = self.now();
        if let Some(iface) = self.iface.as_mut() {
            let _ = iface.poll(now, &mut self.device, &mut self.sockets);
        }
        for frame in self.device.drain_tx() {
            if let Some(link_out) = self.link_out.as_mut() {
                link_out(&frame);
            }
        }
        self.scan();
    }

    /// Diff socket state against the previous round and emit events.
    fn scan(&mut self) {
        let keys: Vec<Pcb> = self.pcbs.keys().copied().collect();
        let mut adopted: Vec<(u64, SocketHandle)> = Vec::new();

        for pcb in keys {
            match self.pcbs.get_mut(&pcb) {
                Some(PcbEntry::Listener(listener)) => {
                    if !listener.accept_enabled {
                        continue;
                    }
                    let mut idx = 0;
                    while idx < listener.slots.len() {
                        let handle = listener.slots[idx];
                        let state = self.sockets.get::<TcpSocket>(handle).state();
                        if matches!(state, TcpState::Established | TcpState::CloseWait) {
                            listener.slots.remove(idx);
                            adopted.push((listener.token.unwrap_or(0), handle));
                        } else {
                            idx += 1;
                        }
                    }
                }
                Some(PcbEntry::Stream(st)) => {
                    let socket = self.sockets.get_mut::<TcpSocket>(st.handle);
                    let token = st.token.unwrap_or(0);
                    let state = socket.state();

                    if st.connecting {
                        if state == TcpState::Established {
                            st.connecting = false;
                            st.was_established = true;
                            st.last_send_queue = socket.send_queue();
                            if st.want_connected {
                                self.events.push_back(StackEvent::Connected { token });
                            }
                        } else if state == TcpState::Closed {
                            // SYN answered by RST (or gave up): connect failed.
                            st.connecting = false;
                            st.eof_emitted = true;
                            if st.want_err {
                                self.events.push_back(StackEvent::Error {
                                    token,
                                    error: StackError::Abort,
                                });
                            }
                            continue;
                        }
                    }

                    if st.want_recv && st.was_established {
                        while socket.can_recv() {
                            let mut chunk = vec![0u8; RECV_CHUNK];
                            match socket.recv_slice(&mut chunk) {
                                Ok(0) => break,
                                Ok(n) => {
                                    chunk.truncate(n);
                                    self.events.push_back(StackEvent::Recv { token, data: chunk });
                                }
                                Err(_) => break,
                            }
                        }
                    }

                    if st.was_established
                        && !st.eof_emitted
                        && !socket.may_recv()
                        && !socket.can_recv()
                    {
                        st.eof_emitted = true;
                        if st.want_recv {
                            self.events.push_back(StackEvent::RemoteClose { token });
                        }
                    }

                    let queue = socket.send_queue();
                    if queue < st.last_send_queue && st.want_sent {
                        self.events.push_back(StackEvent::Sent {
                            token,
                            len: st.last_send_queue - queue,
                        });
                    }
                    st.last_send_queue = queue;
                }
                None => {}
            }
        }

        for (parent, handle) in adopted {
            let send_queue = self.sockets.get::<TcpSocket>(handle).send_queue();
            let child = self.alloc_pcb_id();
            self.pcbs
                .insert(child, PcbEntry::Stream(StreamPcb::adopted(handle, send_queue)));
            trace!(%child, parent, "listener handshake complete");
            self.events.push_back(StackEvent::Accept { parent, child });
        }
    }

    /// Emit per-connection poll-timer events.
    fn run_poll_timers(&mut self) {
        let now_ms = self.now_ms();
        for entry in self.pcbs.values_mut() {
            if let PcbEntry::Stream(st) = entry {
                let Some(half_secs) = st.poll_half_secs else {
                    continue;
                };
                let period_ms = u64::from(half_secs) * 500;
                if now_ms.saturating_sub(st.last_poll_ms) >= period_ms {
                    st.last_poll_ms = now_ms;
                    self.events.push_back(StackEvent::Poll {
                        token: st.token.unwrap_or(0),
                    });
                }
            }
        }
    }

    /// Free closed sockets that were kept around to finish their teardown.
    fn reap_graveyard(&mut self) {
        let sockets = &mut self.sockets;
        self.graveyard.retain(|&handle| {
            if sockets.get::<TcpSocket>(handle).state() == TcpState::Closed {
                sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }
}

impl Default for SmoltcpStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpIpStack for SmoltcpStack {
    fn add_interface(
        &mut self,
        conf: &InterfaceConf,
        link_out: LinkOutFn,
    ) -> Result<(), StackError> {
        if self.iface.is_some() {
            return Err(StackError::Val);
        }
        self.device.mtu = conf.mtu + ETHERNET_HEADER_LEN;

        let mut config = IfaceConfig::new(HardwareAddress::Ethernet(EthernetAddress(conf.mac.0)));
        config.random_seed = RANDOM_SEED;

        let now = self.now();
        let mut iface = Interface::new(config, &mut self.device, now);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(conf.ip), conf.prefix_len));
        });
        let _ = iface.routes_mut().add_default_ipv4_route(conf.gateway);

        debug!(ip = %conf.ip, prefix = conf.prefix_len, mac = %conf.mac, mtu = conf.mtu, "interface up");
        self.iface = Some(iface);
        self.link_out = Some(link_out);
        Ok(())
    }

    fn input_frame(&mut self, frame: &[u8]) -> Result<(), StackError> {
        if self.iface.is_none() {
            return Err(StackError::Interface);
        }
        if !self.device.push_rx(frame.to_vec()) {
            return Err(StackError::Buf);
        }
        self.poll_and_scan();
        Ok(())
    }

    fn tick_tcp(&mut self) {
        self.poll_and_scan();
        self.run_poll_timers();
        self.reap_graveyard();
    }

    fn tick_arp(&mut self) {
        // Neighbor-cache maintenance is folded into the interface poll.
        self.poll_and_scan();
    }

    fn take_events(&mut self) -> Vec<StackEvent> {
        self.events.drain(..).collect()
    }

    fn new_pcb(&mut self) -> Result<Pcb, StackError> {
        let handle = self.sockets.add(Self::new_socket());
        let pcb = self.alloc_pcb_id();
        self.pcbs.insert(pcb, PcbEntry::Stream(StreamPcb::new(handle)));
        Ok(pcb)
    }

    fn bind(&mut self, pcb: Pcb, _addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        if let Some(&owner) = self.bound.get(&port) {
            if owner != pcb {
                return Err(StackError::Use);
            }
        }
        let port = if port == 0 { self.alloc_ephemeral() } else { port };
        let st = self.stream_mut(pcb)?;
        if st.local_port.is_some() {
            return Err(StackError::Val);
        }
        st.local_port = Some(port);
        st.owns_port = true;
        self.bound.insert(port, pcb);
        Ok(())
    }

    fn listen(&mut self, pcb: Pcb, backlog: usize) -> Result<Pcb, StackError> {
        let port = match self.pcbs.get(&pcb) {
            Some(PcbEntry::Stream(st)) => st.local_port.ok_or(StackError::Val)?,
            _ => return Err(StackError::Arg),
        };
        let backlog = backlog.clamp(1, MAX_BACKLOG);

        // The bound stream socket becomes the first accept slot; the rest of
        // the backlog is fresh listening sockets on the same port.
        let Some(PcbEntry::Stream(st)) = self.pcbs.remove(&pcb) else {
            return Err(StackError::Arg);
        };
        let mut slots = Vec::with_capacity(backlog);
        if let Err(e) = self.sockets.get_mut::<TcpSocket>(st.handle).listen(port) {
            let err = match e {
                ListenError::InvalidState | ListenError::Unaddressable => StackError::Val,
            };
            self.pcbs.insert(pcb, PcbEntry::Stream(st));
            return Err(err);
        }
        slots.push(st.handle);
        for _ in 1..backlog {
            match Self::spawn_listen_slot(&mut self.sockets, port) {
                Ok(handle) => slots.push(handle),
                Err(e) => {
                    warn!(%pcb, port, error = %e, "short listener backlog");
                    break;
                }
            }
        }

        let listener = self.alloc_pcb_id();
        self.pcbs.insert(
            listener,
            PcbEntry::Listener(ListenerPcb {
                token: None,
                port,
                backlog,
                slots,
                accept_enabled: false,
            }),
        );
        self.bound.insert(port, listener);
        debug!(old = %pcb, new = %listener, port, backlog, "listening");
        Ok(listener)
    }

    fn accepted(&mut self, pcb: Pcb) {
        let Some(PcbEntry::Listener(listener)) = self.pcbs.get(&pcb) else {
            return;
        };
        let (port, refill) = (listener.port, listener.slots.len() < listener.backlog);
        if refill {
            if let Ok(handle) = Self::spawn_listen_slot(&mut self.sockets, port) {
                if let Some(PcbEntry::Listener(listener)) = self.pcbs.get_mut(&pcb) {
                    listener.slots.push(handle);
                }
            }
        }
    }

    fn connect(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        if self.iface.is_none() {
            return Err(StackError::Route);
        }
        if port == 0 || addr.is_unspecified() {
            return Err(StackError::Val);
        }
        let local_port = match self.pcbs.get(&pcb) {
            Some(PcbEntry::Stream(st)) => {
                if st.connecting || st.was_established {
                    return Err(StackError::IsConn);
                }
                st.local_port
            }
            _ => return Err(StackError::Arg),
        };
        let local_port = match local_port {
            Some(p) => p,
            None => {
                let p = self.alloc_ephemeral();
                self.bound.insert(p, pcb);
                let st = self.stream_mut(pcb)?;
                st.local_port = Some(p);
                st.owns_port = true;
                p
            }
        };

        let st = match self.pcbs.get_mut(&pcb) {
            Some(PcbEntry::Stream(st)) => st,
            _ => return Err(StackError::Arg),
        };
        let handle = st.handle;
        let iface = self.iface.as_mut().ok_or(StackError::Route)?;
        let socket = self.sockets.get_mut::<TcpSocket>(handle);
        socket
            .connect(iface.context(), (IpAddress::Ipv4(addr), port), local_port)
            .map_err(|e| match e {
                ConnectError::InvalidState => StackError::IsConn,
                ConnectError::Unaddressable => StackError::Val,
            })?;
        if let Some(PcbEntry::Stream(st)) = self.pcbs.get_mut(&pcb) {
            st.connecting = true;
        }
        debug!(%pcb, remote = %addr, port, local_port, "connect started");
        self.poll_and_scan();
        Ok(())
    }

    fn write(&mut self, pcb: Pcb, data: &[u8]) -> Result<usize, StackError> {
        let st = self.stream_mut(pcb)?;
        let handle = st.handle;
        let socket = self.sockets.get_mut::<TcpSocket>(handle);
        if !socket.may_send() {
            return Err(StackError::Conn);
        }
        let n = socket.send_slice(data).map_err(|_| StackError::Conn)?;
        let queue = socket.send_queue();
        if let Some(PcbEntry::Stream(st)) = self.pcbs.get_mut(&pcb) {
            st.last_send_queue = queue;
        }
        Ok(n)
    }

    fn output(&mut self, pcb: Pcb) -> Result<(), StackError> {
        if !self.pcbs.contains_key(&pcb) {
            return Err(StackError::Arg);
        }
        self.poll_and_scan();
        Ok(())
    }

    fn snd_buf(&mut self, pcb: Pcb) -> usize {
        match self.pcbs.get(&pcb) {
            Some(PcbEntry::Stream(st)) => {
                let socket = self.sockets.get::<TcpSocket>(st.handle);
                socket.send_capacity() - socket.send_queue()
            }
            _ => 0,
        }
    }

    fn recved(&mut self, _pcb: Pcb, _len: usize) {
        // Window space is freed as payload is drained from the receive
        // buffer; there is no separate acknowledgement step.
    }

    fn close(&mut self, pcb: Pcb) -> Result<(), StackError> {
        match self.pcbs.remove(&pcb) {
            Some(PcbEntry::Stream(st)) => {
                if st.owns_port {
                    if let Some(port) = st.local_port {
                        self.bound.remove(&port);
                    }
                }
                let socket = self.sockets.get_mut::<TcpSocket>(st.handle);
                socket.close();
                self.graveyard.push(st.handle);
                self.poll_and_scan();
                Ok(())
            }
            Some(PcbEntry::Listener(listener)) => {
                for handle in listener.slots {
                    self.sockets.remove(handle);
                }
                self.bound.remove(&listener.port);
                Ok(())
            }
            None => Err(StackError::Arg),
        }
    }

    fn set_conn_token(&mut self, pcb: Pcb, token: Option<u64>) {
        match self.pcbs.get_mut(&pcb) {
            Some(PcbEntry::Stream(st)) => st.token = token,
            Some(PcbEntry::Listener(listener)) => listener.token = token,
            None => {}
        }
    }

    fn on_accept(&mut self, pcb: Pcb, enabled: bool) {
        if let Some(PcbEntry::Listener(listener)) = self.pcbs.get_mut(&pcb) {
            listener.accept_enabled = enabled;
        }
    }

    fn on_recv(&mut self, pcb: Pcb, enabled: bool) {
        if let Ok(st) = self.stream_mut(pcb) {
            st.want_recv = enabled;
        }
    }

    fn on_sent(&mut self, pcb: Pcb, enabled: bool) {
        if let Ok(st) = self.stream_mut(pcb) {
            st.want_sent = enabled;
        }
    }

    fn on_err(&mut self, pcb: Pcb, enabled: bool) {
        if let Ok(st) = self.stream_mut(pcb) {
            st.want_err = enabled;
        }
    }

    fn on_connected(&mut self, pcb: Pcb, enabled: bool) {
        if let Ok(st) = self.stream_mut(pcb) {
            st.want_connected = enabled;
        }
    }

    fn on_poll(&mut self, pcb: Pcb, half_secs: Option<u8>) {
        let now_ms = self.now_ms();
        if let Ok(st) = self.stream_mut(pcb) {
            st.poll_half_secs = half_secs;
            st.last_poll_ms = now_ms;
        }
    }
}
