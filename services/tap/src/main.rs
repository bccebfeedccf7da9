//! netcon-tap dev harness.
//!
//! Brings a tap up against the smoltcp backend with a logging-only overlay
//! handler, so the RPC surface can be exercised locally. A real deployment
//! embeds [`NetconTap`] next to an overlay node that feeds `put_frame` and
//! consumes the egress handler.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netcon_stack::STATUS_TICK_MS;
use netcon_tap::{Config, FrameHandler, NetconTap, SmoltcpStack};

fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fall back to the configured level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        nwid = format_args!("{:016x}", config.nwid),
        ip = %config.ip,
        prefix_len = config.prefix_len,
        mac = %config.mac,
        mtu = config.mtu,
        "Configuration loaded"
    );

    let handler: FrameHandler = Box::new(|nwid, src, dst, ethertype, _vlan, payload| {
        debug!(
            nwid = format_args!("{:016x}", nwid),
            src = %src,
            dst = %dst,
            ethertype = format_args!("{:#06x}", ethertype),
            len = payload.len(),
            "egress frame (no overlay attached)"
        );
    });

    let tap = NetconTap::new(config, Box::new(SmoltcpStack::new()), handler)?;
    info!(device = %tap.device_name(), "netcon tap ready");

    // Periodic status heartbeat until the process is killed.
    loop {
        std::thread::sleep(Duration::from_millis(STATUS_TICK_MS));
        let stats = tap.stats();
        debug!(
            frames_in = stats.frames_in.load(std::sync::atomic::Ordering::Relaxed),
            frames_out = stats.frames_out.load(std::sync::atomic::Ordering::Relaxed),
            frames_dropped = stats.frames_dropped.load(std::sync::atomic::Ordering::Relaxed),
            sessions = stats.sessions_accepted.load(std::sync::atomic::Ordering::Relaxed),
            "status"
        );
    }
}
