//! Scriptable stack for tests and development.
//!
//! `MockStack` records every facade call, lets tests script failures and
//! send-buffer levels, and lets them inject [`StackEvent`]s as if the stack
//! had produced them.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use crate::{InterfaceConf, LinkOutFn, Pcb, StackError, StackEvent, TcpIpStack, TCP_SND_BUF};

/// A facade call recorded by [`MockStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    NewPcb(Pcb),
    Bind { pcb: Pcb, addr: Ipv4Addr, port: u16 },
    Listen { pcb: Pcb, backlog: usize, replacement: Pcb },
    Accepted(Pcb),
    Connect { pcb: Pcb, addr: Ipv4Addr, port: u16 },
    Write { pcb: Pcb, len: usize },
    Output(Pcb),
    Recved { pcb: Pcb, len: usize },
    Close(Pcb),
}

#[derive(Default)]
struct MockPcb {
    token: Option<u64>,
    snd_buf: usize,
    written: Vec<u8>,
    recved: usize,
    armed_accept: bool,
    armed_recv: bool,
    armed_sent: bool,
    armed_err: bool,
    armed_connected: bool,
    poll_half_secs: Option<u8>,
}

/// Scriptable [`TcpIpStack`] for tests.
#[derive(Default)]
pub struct MockStack {
    /// Fail the next `new_pcb` with [`StackError::Mem`].
    pub fail_pcb_alloc: bool,
    /// Scripted `bind` failure.
    pub fail_bind: Option<StackError>,
    /// Scripted `connect` failure.
    pub fail_connect: Option<StackError>,
    /// Scripted `write` failure.
    pub fail_write: Option<StackError>,
    /// Scripted `input_frame` failure.
    pub fail_input: Option<StackError>,

    entries: HashMap<Pcb, MockPcb>,
    calls: Vec<MockCall>,
    events: VecDeque<StackEvent>,
    frames_in: Vec<Vec<u8>>,
    link_out: Option<LinkOutFn>,
    next_pcb: u64,
    tcp_ticks: u64,
    arp_ticks: u64,
}

impl MockStack {
    pub fn new() -> Self {
        Self {
            next_pcb: 1,
            ..Self::default()
        }
    }

    /// Inject an event, as if the stack had produced it.
    pub fn push_event(&mut self, event: StackEvent) {
        self.events.push_back(event);
    }

    /// Every facade call so far, in order.
    pub fn calls(&self) -> &[MockCall] {
        &self.calls
    }

    /// Bytes accepted by `write` for `pcb`.
    pub fn written(&self, pcb: Pcb) -> &[u8] {
        self.entries
            .get(&pcb)
            .map(|e| e.written.as_slice())
            .unwrap_or_default()
    }

    /// Total payload acknowledged via `recved` for `pcb`.
    pub fn recved_total(&self, pcb: Pcb) -> usize {
        self.entries.get(&pcb).map(|e| e.recved).unwrap_or(0)
    }

    /// Replenish the scripted send-buffer level.
    pub fn set_snd_buf(&mut self, pcb: Pcb, n: usize) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.snd_buf = n;
        }
    }

    /// Whether the PCB is still alive.
    pub fn is_open(&self, pcb: Pcb) -> bool {
        self.entries.contains_key(&pcb)
    }

    pub fn token(&self, pcb: Pcb) -> Option<u64> {
        self.entries.get(&pcb).and_then(|e| e.token)
    }

    pub fn armed_recv(&self, pcb: Pcb) -> bool {
        self.entries.get(&pcb).is_some_and(|e| e.armed_recv)
    }

    pub fn armed_sent(&self, pcb: Pcb) -> bool {
        self.entries.get(&pcb).is_some_and(|e| e.armed_sent)
    }

    pub fn armed_err(&self, pcb: Pcb) -> bool {
        self.entries.get(&pcb).is_some_and(|e| e.armed_err)
    }

    pub fn armed_connected(&self, pcb: Pcb) -> bool {
        self.entries.get(&pcb).is_some_and(|e| e.armed_connected)
    }

    pub fn armed_accept(&self, pcb: Pcb) -> bool {
        self.entries.get(&pcb).is_some_and(|e| e.armed_accept)
    }

    pub fn poll_period(&self, pcb: Pcb) -> Option<u8> {
        self.entries.get(&pcb).and_then(|e| e.poll_half_secs)
    }

    /// Frames fed to the stack via `input_frame`.
    pub fn frames_in(&self) -> &[Vec<u8>] {
        &self.frames_in
    }

    pub fn tcp_ticks(&self) -> u64 {
        self.tcp_ticks
    }

    pub fn arp_ticks(&self) -> u64 {
        self.arp_ticks
    }

    fn alloc(&mut self) -> Pcb {
        let pcb = Pcb(self.next_pcb);
        self.next_pcb += 1;
        self.entries.insert(
            pcb,
            MockPcb {
                snd_buf: TCP_SND_BUF,
                ..MockPcb::default()
            },
        );
        pcb
    }
}

impl TcpIpStack for MockStack {
    fn add_interface(
        &mut self,
        _conf: &InterfaceConf,
        link_out: LinkOutFn,
    ) -> Result<(), StackError> {
        if self.link_out.is_some() {
            return Err(StackError::Val);
        }
        self.link_out = Some(link_out);
        Ok(())
    }

    fn input_frame(&mut self, frame: &[u8]) -> Result<(), StackError> {
        if let Some(e) = self.fail_input {
            return Err(e);
        }
        self.frames_in.push(frame.to_vec());
        Ok(())
    }

    fn tick_tcp(&mut self) {
        self.tcp_ticks += 1;
    }

    fn tick_arp(&mut self) {
        self.arp_ticks += 1;
    }

    fn take_events(&mut self) -> Vec<StackEvent> {
        self.events.drain(..).collect()
    }

    fn new_pcb(&mut self) -> Result<Pcb, StackError> {
        if self.fail_pcb_alloc {
            return Err(StackError::Mem);
        }
        let pcb = self.alloc();
        self.calls.push(MockCall::NewPcb(pcb));
        Ok(pcb)
    }

    fn bind(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        self.calls.push(MockCall::Bind { pcb, addr, port });
        if let Some(e) = self.fail_bind {
            return Err(e);
        }
        if !self.entries.contains_key(&pcb) {
            return Err(StackError::Arg);
        }
        Ok(())
    }

    fn listen(&mut self, pcb: Pcb, backlog: usize) -> Result<Pcb, StackError> {
        if self.entries.remove(&pcb).is_none() {
            return Err(StackError::Arg);
        }
        let replacement = self.alloc();
        self.calls.push(MockCall::Listen {
            pcb,
            backlog,
            replacement,
        });
        Ok(replacement)
    }

    fn accepted(&mut self, pcb: Pcb) {
        self.calls.push(MockCall::Accepted(pcb));
    }

    fn connect(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        self.calls.push(MockCall::Connect { pcb, addr, port });
        if let Some(e) = self.fail_connect {
            return Err(e);
        }
        if !self.entries.contains_key(&pcb) {
            return Err(StackError::Arg);
        }
        Ok(())
    }

    fn write(&mut self, pcb: Pcb, data: &[u8]) -> Result<usize, StackError> {
        self.calls.push(MockCall::Write {
            pcb,
            len: data.len(),
        });
        if let Some(e) = self.fail_write {
            return Err(e);
        }
        let entry = self.entries.get_mut(&pcb).ok_or(StackError::Arg)?;
        let n = data.len().min(entry.snd_buf);
        entry.written.extend_from_slice(&data[..n]);
        entry.snd_buf -= n;
        Ok(n)
    }

    fn output(&mut self, pcb: Pcb) -> Result<(), StackError> {
        self.calls.push(MockCall::Output(pcb));
        Ok(())
    }

    fn snd_buf(&mut self, pcb: Pcb) -> usize {
        self.entries.get(&pcb).map(|e| e.snd_buf).unwrap_or(0)
    }

    fn recved(&mut self, pcb: Pcb, len: usize) {
        self.calls.push(MockCall::Recved { pcb, len });
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.recved += len;
        }
    }

    fn close(&mut self, pcb: Pcb) -> Result<(), StackError> {
        self.calls.push(MockCall::Close(pcb));
        if self.entries.remove(&pcb).is_none() {
            return Err(StackError::Arg);
        }
        Ok(())
    }

    fn set_conn_token(&mut self, pcb: Pcb, token: Option<u64>) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.token = token;
        }
    }

    fn on_accept(&mut self, pcb: Pcb, enabled: bool) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.armed_accept = enabled;
        }
    }

    fn on_recv(&mut self, pcb: Pcb, enabled: bool) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.armed_recv = enabled;
        }
    }

    fn on_sent(&mut self, pcb: Pcb, enabled: bool) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.armed_sent = enabled;
        }
    }

    fn on_err(&mut self, pcb: Pcb, enabled: bool) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.armed_err = enabled;
        }
    }

    fn on_connected(&mut self, pcb: Pcb, enabled: bool) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.armed_connected = enabled;
        }
    }

    fn on_poll(&mut self, pcb: Pcb, half_secs: Option<u8>) {
        if let Some(entry) = self.entries.get_mut(&pcb) {
            entry.poll_half_secs = half_secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_records_lifecycle_calls() {
        let mut stack = MockStack::new();
        let pcb = stack.new_pcb().unwrap();
        stack.bind(pcb, Ipv4Addr::new(10, 0, 0, 1), 80).unwrap();
        let listener = stack.listen(pcb, 5).unwrap();
        assert_ne!(listener, pcb);
        assert!(matches!(stack.calls()[0], MockCall::NewPcb(p) if p == pcb));
        assert!(matches!(
            stack.calls()[2],
            MockCall::Listen { backlog: 5, .. }
        ));
    }

    #[test]
    fn test_mock_write_respects_snd_buf() {
        let mut stack = MockStack::new();
        let pcb = stack.new_pcb().unwrap();
        stack.set_snd_buf(pcb, 3);
        assert_eq!(stack.write(pcb, b"hello").unwrap(), 3);
        assert_eq!(stack.snd_buf(pcb), 0);
        assert_eq!(stack.written(pcb), b"hel");
    }

    #[test]
    fn test_mock_scripted_failure() {
        let mut stack = MockStack::new();
        stack.fail_pcb_alloc = true;
        assert_eq!(stack.new_pcb(), Err(StackError::Mem));
    }
}
