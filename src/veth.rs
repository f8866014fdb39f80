//! Component C: veth pair provisioning — create, attach to the bridge, and
//! hand the peer off into the container's network namespace.

use std::process::Command;

use rand::Rng;
use tracing::debug;

use crate::bridge::BRIDGE_NAME;
use crate::error::PlumbingError;
use crate::ipalloc;

/// Kernel interface names are capped at `IFNAMSIZ - 1` (15) bytes; `vethh`
/// + 6 hex chars is comfortably under that.
fn random_veth_name(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| format!("{:x}", rng.random_range(0..16u8)))
        .collect();
    format!("{prefix}{suffix}")
}

fn ip(args: &[&str]) -> Result<(), PlumbingError> {
    let status = Command::new("ip")
        .args(args)
        .status()
        .map_err(PlumbingError::Veth)?;
    if !status.success() {
        return Err(PlumbingError::Veth(std::io::Error::other(format!(
            "ip {args:?} exited with {status}"
        ))));
    }
    Ok(())
}

/// Create a veth pair, attach the host end to the bridge, allocate an IP
/// for the container side, and move the peer into `target_pid`'s network
/// namespace. Returns `(ip_cidr, host_veth_name, cont_veth_name)`.
pub fn create_and_attach(
    ip_state_path: &std::path::Path,
    target_pid: i32,
) -> Result<(String, String, String), PlumbingError> {
    let host_veth = random_veth_name("vethh");
    let cont_veth = random_veth_name("vethc");

    debug!(%host_veth, %cont_veth, pid = target_pid, "provisioning veth pair");

    let addr = ipalloc::allocate(ip_state_path)?;

    let wire_up = || -> Result<(), PlumbingError> {
        ip(&[
            "link", "add", &host_veth, "type", "veth", "peer", "name", &cont_veth,
        ])?;
        ip(&["link", "set", &host_veth, "master", BRIDGE_NAME])?;
        ip(&["link", "set", &host_veth, "up"])?;
        ip(&[
            "link",
            "set",
            &cont_veth,
            "netns",
            target_pid.to_string().as_str(),
        ])?;
        Ok(())
    };

    if let Err(e) = wire_up() {
        // The address was already appended to the pool file; give it back
        // rather than leaking it on a partially-wired veth pair.
        ipalloc::release(ip_state_path, &addr).ok();
        return Err(e);
    }

    debug!(%addr, %cont_veth, pid = target_pid, "veth pair attached and moved");
    Ok((format!("{addr}/24"), host_veth, cont_veth))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_veth_name_fits_kernel_ifnamsiz() {
        let name = random_veth_name("vethh");
        assert!(name.len() < 16, "interface name too long: {name}");
        assert!(name.starts_with("vethh"));
    }
}
