//! Tap configuration (env-driven).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use netcon_stack::Mac;

/// Default interface MTU for the overlay.
pub const DEFAULT_MTU: usize = 2800;

/// Gateway installed on the virtual interface.
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);

/// Tap configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overlay network id; names the rendezvous socket.
    pub nwid: u64,

    /// Interface IPv4 address. Client binds resolve against this address.
    pub ip: Ipv4Addr,

    /// Prefix length of the interface address.
    pub prefix_len: u8,

    /// Interface hardware address.
    pub mac: Mac,

    /// Interface MTU.
    pub mtu: usize,

    /// Directory holding the rendezvous socket.
    pub runtime_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Build a configuration with defaults for everything but the identity.
    pub fn new(nwid: u64, ip: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            nwid,
            ip,
            prefix_len,
            mac: derive_mac(nwid),
            mtu: DEFAULT_MTU,
            runtime_dir: PathBuf::from("/tmp"),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let nwid = std::env::var("NETCON_NWID")
            .context("Missing network id. Set NETCON_NWID (16 hex digits).")?;
        let nwid = u64::from_str_radix(nwid.trim(), 16)
            .context("NETCON_NWID must be a 16-hex-digit network id.")?;

        let ip_cidr = std::env::var("NETCON_IP")
            .context("Missing interface address. Set NETCON_IP (e.g. 10.6.6.2/24).")?;
        let (ip, prefix_len) = parse_ipv4_cidr(&ip_cidr)?;

        let mac = match std::env::var("NETCON_MAC") {
            Ok(raw) => raw
                .trim()
                .parse::<Mac>()
                .ok()
                .context("NETCON_MAC must look like 02:ab:cd:ef:01:23.")?,
            Err(_) => derive_mac(nwid),
        };

        let mtu: usize = std::env::var("NETCON_MTU")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("NETCON_MTU must be an integer.")?
            .unwrap_or(DEFAULT_MTU)
            .clamp(576, 9000);

        let runtime_dir = std::env::var("NETCON_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));

        let log_level = std::env::var("NETCON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            nwid,
            ip,
            prefix_len,
            mac,
            mtu,
            runtime_dir,
            log_level,
        })
    }

    /// Filesystem rendezvous the shim connects to.
    pub fn rendezvous_path(&self) -> PathBuf {
        self.runtime_dir.join(format!(".ztnc_{:016x}", self.nwid))
    }
}

/// Parse `a.b.c.d/len` notation.
fn parse_ipv4_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = s
        .trim()
        .split_once('/')
        .with_context(|| format!("missing '/' in CIDR: {}", s))?;
    let ip: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid IPv4 address: {}", addr))?;
    let prefix_len: u8 = prefix
        .parse()
        .with_context(|| format!("invalid prefix length: {}", prefix))?;
    if prefix_len > 32 {
        anyhow::bail!("prefix length {} exceeds 32", prefix_len);
    }
    Ok((ip, prefix_len))
}

/// Derive a stable, locally administered MAC from the network id.
fn derive_mac(nwid: u64) -> Mac {
    let b = nwid.to_be_bytes();
    Mac([0x02, b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendezvous_path_is_nwid_hex() {
        let config = Config::new(0xdeadbeef_00112233, Ipv4Addr::new(10, 1, 1, 1), 24);
        assert_eq!(
            config.rendezvous_path(),
            PathBuf::from("/tmp/.ztnc_deadbeef00112233")
        );
    }

    #[test]
    fn test_cidr_parsing() {
        assert_eq!(
            parse_ipv4_cidr("10.6.6.2/24").unwrap(),
            (Ipv4Addr::new(10, 6, 6, 2), 24)
        );
        assert!(parse_ipv4_cidr("10.6.6.2").is_err());
        assert!(parse_ipv4_cidr("10.6.6.2/40").is_err());
        assert!(parse_ipv4_cidr("10.6.6/24").is_err());
    }

    #[test]
    fn test_derived_mac_is_stable_and_local() {
        let a = derive_mac(0x1122334455667788);
        let b = derive_mac(0x1122334455667788);
        assert_eq!(a, b);
        assert_eq!(a.0[0], 0x02);
        assert_ne!(a, derive_mac(0x1122334455667789));
    }
}
