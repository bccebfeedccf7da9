//! Fallible construction and teardown of the tap itself.


use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use harness::unique_nwid;
use netcon_stack::{InterfaceConf, Mac, MockStack, TcpIpStack};
use netcon_tap::{Config, NetconTap, TapError};

fn noop_handler() -> netcon_tap::FrameHandler {
    Box::new(|_nwid, _src, _dst, _ethertype, _vlan, _payload| {})
}

#[test]
fn test_rendezvous_bind_failure_is_reported() {
    let mut config = Config::new(unique_nwid(), Ipv4Addr::new(10, 66, 0, 1), 24);
    config.runtime_dir = PathBuf::from("/nonexistent-netcon-test-dir");

    let err = NetconTap::new(config, Box::new(MockStack::new()), noop_handler())
        .err()
        .expect("bind must fail");
    assert!(matches!(err, TapError::RendezvousBindFailed { .. }), "{err}");
}

#[test]
fn test_stack_init_failure_is_reported() {
    // A stack that already has an interface rejects a second one.
    let mut stack = MockStack::new();
    let conf = InterfaceConf {
        ip: Ipv4Addr::new(10, 66, 0, 1),
        prefix_len: 24,
        gateway: Ipv4Addr::new(192, 168, 0, 1),
        mac: Mac([2, 0, 0, 0, 0, 1]),
        mtu: 2800,
    };
    stack.add_interface(&conf, Box::new(|_frame| {})).unwrap();

    let config = Config::new(unique_nwid(), Ipv4Addr::new(10, 66, 0, 1), 24);
    let err = NetconTap::new(config, Box::new(stack), noop_handler())
        .err()
        .expect("stack init must fail");
    assert!(matches!(err, TapError::StackLoadFailed(_)), "{err}");
}

#[test]
fn test_shutdown_removes_rendezvous_socket() {
    let config = Config::new(unique_nwid(), Ipv4Addr::new(10, 66, 0, 1), 24);
    let path = config.rendezvous_path();

    let mut tap = NetconTap::new(config, Box::new(MockStack::new()), noop_handler()).unwrap();
    assert!(Path::new(&path).exists());
    assert_eq!(tap.device_name(), path.display().to_string());

    tap.shutdown();
    assert!(!Path::new(&path).exists());
}
