//! Component B: idempotent creation of the host bridge interface.

use std::process::Command;

use tracing::{debug, info, warn};

pub const BRIDGE_NAME: &str = "xocker0";
pub const GATEWAY_IP: &str = "172.18.0.1";
pub const GATEWAY_CIDR: &str = "172.18.0.1/24";

fn ip(args: &[&str]) -> std::io::Result<std::process::ExitStatus> {
    Command::new("ip").args(args).status()
}

fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Ensure the host bridge exists, is addressed, and is up. Safe to call on
/// every run: a bridge that's already there is just brought up again.
pub fn ensure_bridge(name: &str, cidr: &str) -> std::io::Result<()> {
    if link_exists(name) {
        debug!(bridge = name, "bridge already exists, ensuring it's up");
        ip(&["link", "set", "dev", name, "up"])?;
        return Ok(());
    }

    info!(bridge = name, "creating bridge");
    ip(&["link", "add", "name", name, "type", "bridge"])?;

    if let Err(e) = ip(&["addr", "add", cidr, "dev", name]) {
        warn!(bridge = name, %cidr, error = %e, "failed to address bridge, it may already have this IP");
    }

    ip(&["link", "set", "dev", name, "up"])?;
    info!(bridge = name, %cidr, "bridge created and configured");
    Ok(())
}
