//! Toggle a switching actuator through a KNXnet/IP tunnel
//!
//! Reads the current value of a group address, writes the inverse and
//! then watches bus traffic for a few seconds.
//!
//! # Setup
//!
//! ```bash
//! KNX_GATEWAY_IP=192.168.1.10 RUST_LOG=info cargo run --example toggle_light -- 1/2/3
//! ```
//!
//! The group address defaults to `1/2/3` when none is given.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use knx_tunnel::{GroupAddress, TunnelConfig, TunnelSession, ValueCache};

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("toggle_light: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> knx_tunnel::Result<()> {
    let addr: GroupAddress = std::env::args().nth(1).as_deref().unwrap_or("1/2/3").parse()?;
    let config = TunnelConfig::from_env()?;
    let cache = Arc::new(ValueCache::new());

    let mut session = TunnelSession::with_cache(config, Arc::clone(&cache));
    session.connect()?;

    let before = session.group_read(addr, false)?;
    println!("{addr}: {before:02X?}");

    let after = session.group_toggle(addr, true)?;
    println!("{addr}: toggled to {after}");

    // Let the listener pick up whatever else is on the bus
    thread::sleep(Duration::from_secs(5));
    println!("{} group addresses seen", cache.len());

    session.disconnect()
}
