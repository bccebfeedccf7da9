//! netcon-tap
//!
//! Userspace network containment tap: lets unmodified local processes do
//! stream-socket I/O over a virtual overlay network without touching the
//! kernel's network stack. An interception shim inside each client rewrites
//! socket calls into RPCs over a filesystem rendezvous socket; the tap
//! terminates them against an embedded userspace TCP/IP stack that exchanges
//! Ethernet frames with the overlay.
//!
//! ```text
//! client shim ──rendezvous──▶ RPC demux ──▶ lifecycle ──▶ stack facade
//!       ▲                                                    │  ▲
//!       └──── stream pair ◀── data pump ◀── stack events ────┘  │
//!                                                               ▼
//!                               overlay ◀── frame bridge ──▶ put_frame
//! ```
//!
//! ## Modules
//!
//! - `bridge`: Ethernet frame assembly between overlay and stack
//! - `rpc`: wire protocol and descriptor passing
//! - `registry`: sessions, connections, and their indexes
//! - `pump`: byte movement with flow control in both directions
//! - `lifecycle`: RPC handlers, stack event dispatch, teardown
//! - `reactor`: the single poll thread driving everything
//! - `config`: env-driven configuration
//!
//! ## Locking
//!
//! Two locks, strictly ordered: the stack lock wraps every facade call and
//! every event handler (which run before the lock is released, via
//! [`TapShared::with_stack`]); the registry lock is only ever taken inside
//! it, never the other way around. Nothing blocks under either lock — every
//! stream is non-blocking and the reactor's poll wait holds neither.

use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, info, warn};

pub mod bridge;
pub mod config;
mod lifecycle;
mod pump;
mod reactor;
mod registry;
pub mod rpc;

pub use bridge::FrameHandler;
pub use config::Config;

// Re-export the stack surface embedders need.
pub use netcon_stack::{Mac, MockStack, SmoltcpStack, StackError, TcpIpStack};

use netcon_stack::InterfaceConf;
use registry::Registry;

/// Construction failures.
#[derive(Debug, Error)]
pub enum TapError {
    /// The stack backend could not be brought up.
    #[error("stack backend failed to initialize: {0}")]
    StackLoadFailed(StackError),

    /// The rendezvous socket could not be bound.
    #[error("unable to bind rendezvous socket at {}: {source}", .path.display())]
    RendezvousBindFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The reactor thread or its wake channel could not be set up.
    #[error("unable to set up the reactor: {0}")]
    ReactorSetupFailed(std::io::Error),
}

/// Tap counters.
#[derive(Debug, Default)]
pub struct TapStats {
    /// Frames accepted from the overlay.
    pub frames_in: AtomicU64,
    /// Frames emitted to the overlay.
    pub frames_out: AtomicU64,
    /// Overlay frames dropped (pool exhaustion or no interface).
    pub frames_dropped: AtomicU64,
    /// RPC sessions accepted on the rendezvous.
    pub sessions_accepted: AtomicU64,
    /// Connections created (sockets plus accepted children).
    pub connections_opened: AtomicU64,
    /// Connections torn down.
    pub connections_closed: AtomicU64,
}

/// State shared between the reactor, the overlay ingress path, and the
/// embedder-facing handle.
pub(crate) struct TapShared {
    /// The stack lock: serializes every facade call and event handler.
    pub(crate) stack: Mutex<Box<dyn TcpIpStack>>,
    /// The registry lock; taken only while the stack lock is already held or
    /// for lock-free-path snapshots, never around a stack acquisition.
    pub(crate) registry: Mutex<Registry>,
    pub(crate) run: AtomicBool,
    pub(crate) enabled: AtomicBool,
    pub(crate) wake_tx: UnixStream,
    pub(crate) wake_rx: UnixStream,
    pub(crate) stats: Arc<TapStats>,
    pub(crate) config: Config,
}

impl TapShared {
    fn lock_stack(&self) -> MutexGuard<'_, Box<dyn TcpIpStack>> {
        // A poisoned lock only means a handler panicked; the stack itself is
        // still the best we have for teardown.
        self.stack.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` under the stack lock, then dispatch every event the stack
    /// produced — still under the same lock acquisition, so handlers see a
    /// stack nobody else has touched in between.
    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&mut dyn TcpIpStack) -> R) -> R {
        let mut guard = self.lock_stack();
        let result = f(guard.as_mut());
        loop {
            let events = guard.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                lifecycle::dispatch_event(self, guard.as_mut(), event);
            }
        }
        result
    }

    /// Kick the reactor out of its poll so it rebuilds the watch set.
    pub(crate) fn wake(&self) {
        let _ = (&self.wake_tx).write(b"w");
    }
}

/// The tap. Construct one per overlay network; dropping it stops the reactor
/// and releases every session, connection, and the rendezvous socket.
pub struct NetconTap {
    shared: Arc<TapShared>,
    reactor: Option<JoinHandle<()>>,
}

impl NetconTap {
    /// Bring the tap up: install the virtual interface on `stack`, bind the
    /// rendezvous socket, and start the reactor.
    pub fn new(
        config: Config,
        mut stack: Box<dyn TcpIpStack>,
        handler: FrameHandler,
    ) -> Result<Self, TapError> {
        let stats = Arc::new(TapStats::default());

        let iface = InterfaceConf {
            ip: config.ip,
            prefix_len: config.prefix_len,
            gateway: config::DEFAULT_GATEWAY,
            mac: config.mac,
            mtu: config.mtu,
        };
        let nwid = config.nwid;
        let link_stats = Arc::clone(&stats);
        let mut handler = handler;
        stack
            .add_interface(
                &iface,
                Box::new(move |frame| {
                    if let Some((dst, src, ethertype, payload)) = bridge::parse_frame(frame) {
                        link_stats.frames_out.fetch_add(1, Ordering::Relaxed);
                        handler(nwid, src, dst, ethertype, 0, payload);
                    }
                }),
            )
            .map_err(TapError::StackLoadFailed)?;

        let path = config.rendezvous_path();
        // A stale socket from a previous run would fail the bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(|source| TapError::RendezvousBindFailed {
            path: path.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TapError::RendezvousBindFailed {
                path: path.clone(),
                source,
            })?;

        let (wake_tx, wake_rx) = UnixStream::pair().map_err(TapError::ReactorSetupFailed)?;
        wake_tx
            .set_nonblocking(true)
            .map_err(TapError::ReactorSetupFailed)?;
        wake_rx
            .set_nonblocking(true)
            .map_err(TapError::ReactorSetupFailed)?;

        let shared = Arc::new(TapShared {
            stack: Mutex::new(stack),
            registry: Mutex::new(Registry::new()),
            run: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            wake_tx,
            wake_rx,
            stats,
            config,
        });

        let reactor_shared = Arc::clone(&shared);
        let reactor = std::thread::Builder::new()
            .name("netcon-reactor".to_string())
            .spawn(move || reactor::run(reactor_shared, listener))
            .map_err(TapError::ReactorSetupFailed)?;

        info!(
            device = %shared.config.rendezvous_path().display(),
            ip = %shared.config.ip,
            mac = %shared.config.mac,
            "tap up"
        );
        Ok(Self {
            shared,
            reactor: Some(reactor),
        })
    }

    /// Overlay ingress: synthesize an Ethernet frame and hand it to the
    /// stack. Callable from any thread; drops (with a counter) rather than
    /// blocking when the frame pool is exhausted.
    pub fn put_frame(&self, src: Mac, dst: Mac, ethertype: u16, payload: &[u8]) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }
        let frame = bridge::assemble_frame(src, dst, ethertype, payload);
        match self.shared.with_stack(|stack| stack.input_frame(&frame)) {
            Ok(()) => {
                self.shared.stats.frames_in.fetch_add(1, Ordering::Relaxed);
            }
            Err(StackError::Buf) => {
                self.shared
                    .stats
                    .frames_dropped
                    .fetch_add(1, Ordering::Relaxed);
                warn!("inbound frame dropped: pool exhausted");
            }
            Err(e) => {
                self.shared
                    .stats
                    .frames_dropped
                    .fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "inbound frame dropped");
            }
        }
    }

    /// The rendezvous path doubles as the tap's device name.
    pub fn device_name(&self) -> String {
        self.shared.config.rendezvous_path().display().to_string()
    }

    /// Interface address client binds resolve against.
    pub fn ip(&self) -> std::net::Ipv4Addr {
        self.shared.config.ip
    }

    /// Overlay network id.
    pub fn nwid(&self) -> u64 {
        self.shared.config.nwid
    }

    pub fn stats(&self) -> Arc<TapStats> {
        Arc::clone(&self.shared.stats)
    }

    /// While disabled, overlay frames are silently dropped.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Stop the reactor; it flushes every connection and session and removes
    /// the rendezvous socket on its way out.
    pub fn shutdown(&mut self) {
        self.shared.run.store(false, Ordering::Release);
        self.shared.wake();
        if let Some(reactor) = self.reactor.take() {
            if reactor.join().is_err() {
                warn!("reactor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for NetconTap {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) fn test_shared() -> Arc<TapShared> {
    let (wake_tx, wake_rx) = UnixStream::pair().unwrap();
    wake_tx.set_nonblocking(true).unwrap();
    wake_rx.set_nonblocking(true).unwrap();
    Arc::new(TapShared {
        stack: Mutex::new(Box::new(MockStack::new())),
        registry: Mutex::new(Registry::new()),
        run: AtomicBool::new(true),
        enabled: AtomicBool::new(true),
        wake_tx,
        wake_rx,
        stats: Arc::new(TapStats::default()),
        config: Config::new(0x00c0_ffee_0000_a11c, std::net::Ipv4Addr::new(10, 7, 7, 1), 24),
    })
}
