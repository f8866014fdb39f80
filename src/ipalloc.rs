//! Component A: a persistent, file-backed pool of IPv4 host addresses in a
//! /24. One IP per line, UTF-8, LF-terminated; the first line is always the
//! gateway. See `IPState` in the design doc for the full invariant set.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::{debug, info};

use crate::error::IpAllocError;

const GATEWAY: &str = "172.18.0.1";

fn read_lines(path: &Path) -> Result<Vec<String>, IpAllocError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(IpAllocError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Create the IP state file with just the gateway line if it doesn't exist
/// or is empty. Leaves an already-populated file untouched.
pub fn init(path: &Path) -> Result<(), IpAllocError> {
    let lines = read_lines(path)?;
    if !lines.is_empty() {
        debug!(?path, count = lines.len(), "IP state already initialized");
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|source| IpAllocError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    writeln!(file, "{GATEWAY}").map_err(|source| IpAllocError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(?path, gateway = GATEWAY, "initialized IP state file");
    Ok(())
}

fn used_octets(lines: &[String]) -> std::collections::HashSet<u8> {
    lines
        .iter()
        .filter_map(|l| l.parse::<Ipv4Addr>().ok())
        .map(|ip| ip.octets()[3])
        .collect()
}

/// Allocate the next free host address in the pool's /24, appending it to
/// the state file. The gateway (line 1) can never be returned since it's
/// already in the used set.
pub fn allocate(path: &Path) -> Result<String, IpAllocError> {
    let lines = read_lines(path)?;
    let base_line = lines
        .first()
        .ok_or_else(|| IpAllocError::NoSubnetBase(path.to_path_buf()))?;
    let base: Ipv4Addr = base_line
        .parse()
        .map_err(|_| IpAllocError::InvalidBase {
            path: path.to_path_buf(),
            line: base_line.clone(),
        })?;
    let octets = base.octets();
    let used = used_octets(&lines);

    let next = (1u16..=254)
        .map(|n| n as u8)
        .find(|n| !used.contains(n))
        .ok_or_else(|| IpAllocError::Exhausted(path.to_path_buf()))?;

    let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], next);
    let ip_str = ip.to_string();

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| IpAllocError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    writeln!(file, "{ip_str}").map_err(|source| IpAllocError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(%ip_str, ?path, "allocated container IP");
    Ok(ip_str)
}

/// Release a previously-allocated address. Idempotent: releasing an IP
/// that isn't present leaves the file unchanged.
pub fn release(path: &Path, ip: &str) -> Result<(), IpAllocError> {
    let lines = read_lines(path)?;
    let filtered: Vec<&String> = lines.iter().filter(|l| l.trim() != ip).collect();

    if filtered.len() == lines.len() {
        debug!(%ip, ?path, "release of absent IP, nothing to do");
        return Ok(());
    }

    let mut out = String::new();
    for line in &filtered {
        out.push_str(line);
        out.push('\n');
    }
    fs::write(path, out).map_err(|source| IpAllocError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(%ip, ?path, "released container IP");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn state_file() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip.state");
        (dir, path)
    }

    #[test]
    fn init_writes_gateway_on_empty_file() {
        let (_dir, path) = state_file();
        init(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "172.18.0.1\n");
    }

    #[test]
    fn init_leaves_populated_file_untouched() {
        let (_dir, path) = state_file();
        fs::write(&path, "172.18.0.1\n172.18.0.5\n").unwrap();
        init(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "172.18.0.1\n172.18.0.5\n");
    }

    #[test]
    fn allocate_fills_holes_in_order() {
        let (_dir, path) = state_file();
        fs::write(&path, "172.18.0.1\n172.18.0.2\n172.18.0.4\n").unwrap();
        assert_eq!(allocate(&path).unwrap(), "172.18.0.3");
    }

    #[test]
    fn allocate_appends_sequentially_from_fresh_state() {
        let (_dir, path) = state_file();
        init(&path).unwrap();
        assert_eq!(allocate(&path).unwrap(), "172.18.0.2");
        assert_eq!(allocate(&path).unwrap(), "172.18.0.3");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "172.18.0.1\n172.18.0.2\n172.18.0.3\n"
        );
    }

    #[test]
    fn allocate_on_empty_file_fails_with_no_subnet_base() {
        let (_dir, path) = state_file();
        fs::write(&path, "").unwrap();
        assert!(matches!(
            allocate(&path).unwrap_err(),
            IpAllocError::NoSubnetBase(_)
        ));
    }

    #[test]
    fn allocate_with_invalid_base_line_fails() {
        let (_dir, path) = state_file();
        fs::write(&path, "not-an-ip\n").unwrap();
        assert!(matches!(
            allocate(&path).unwrap_err(),
            IpAllocError::InvalidBase { .. }
        ));
    }

    #[test]
    fn allocate_exhausted_does_not_modify_file() {
        let (_dir, path) = state_file();
        let mut contents = String::from("172.18.0.1\n");
        for i in 1..=254u16 {
            contents.push_str(&format!("172.18.0.{}\n", i));
        }
        fs::write(&path, &contents).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(matches!(
            allocate(&path).unwrap_err(),
            IpAllocError::Exhausted(_)
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn release_is_idempotent_for_absent_ip() {
        let (_dir, path) = state_file();
        fs::write(&path, "172.18.0.1\n172.18.0.2\n").unwrap();
        release(&path, "172.18.0.99").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "172.18.0.1\n172.18.0.2\n"
        );
    }

    #[test]
    fn release_removes_matching_line_only() {
        let (_dir, path) = state_file();
        fs::write(&path, "172.18.0.1\n172.18.0.2\n172.18.0.3\n").unwrap();
        release(&path, "172.18.0.2").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "172.18.0.1\n172.18.0.3\n"
        );
    }

    #[test]
    fn roundtrip_allocate_then_release_restores_state() {
        let (_dir, path) = state_file();
        init(&path).unwrap();
        let ip = allocate(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "172.18.0.1\n172.18.0.2\n");
        release(&path, &ip).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "172.18.0.1\n");
    }
}
