//! Component D: in-namespace network configuration, run by the child once
//! it has received its IP/veth/gateway over the sync channel.

use std::process::Command;

use tracing::debug;

use crate::error::MountError;

fn ip(args: &[&str]) -> Result<(), MountError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(MountError::Network)?;
    if !output.status.success() {
        return Err(MountError::Network(std::io::Error::other(format!(
            "ip {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ))));
    }
    Ok(())
}

/// Address the container's veth peer, bring it up, bring up loopback, and
/// add the default route via the gateway.
pub fn configure(cont_veth: &str, ip_cidr: &str, gateway_ip: &str) -> Result<(), MountError> {
    ip(&["addr", "add", ip_cidr, "dev", cont_veth])?;
    debug!(veth = cont_veth, ip = ip_cidr, "assigned container IP");

    ip(&["link", "set", cont_veth, "up"])?;
    debug!(veth = cont_veth, "brought up veth peer");

    ip(&["link", "set", "lo", "up"])?;
    debug!("brought up loopback");

    ip(&["route", "add", "default", "via", gateway_ip])?;
    debug!(gateway = gateway_ip, "added default route");

    Ok(())
}
