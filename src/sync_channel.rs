//! Component F: the parent/child sync channel — a connected socket pair
//! carried across the fork boundary as a file descriptor distinct from
//! stdio, used once as a ready-signal-plus-config courier.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::mpsc;
use std::time::Duration;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::error::HandshakeError;

pub const READY_SENTINEL: &[u8] = b"READY\n";
const MAX_CONFIG_BYTES: usize = 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The fixed, pre-agreed fd slot the child expects its end of the sync
/// channel on — distinct from stdin/stdout/stderr (0-2).
pub const CHILD_FD_SLOT: RawFd = 3;

/// Create a connected `AF_UNIX`/`SOCK_STREAM` pair with no close-on-exec
/// flag, so the child's end survives the `unshare` re-exec.
pub fn create_pair() -> nix::Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
}

/// Arrange for `child_fd` to appear at [`CHILD_FD_SLOT`] in the process
/// `cmd` is about to spawn, by dup2-ing it into place right before exec.
pub fn inherit_into_child(cmd: &mut Command, child_fd: OwnedFd) {
    let raw = child_fd.into_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            if raw != CHILD_FD_SLOT {
                if libc::dup2(raw, CHILD_FD_SLOT) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(raw);
            }
            Ok(())
        });
    }
}

/// Re-open the inherited fd at [`CHILD_FD_SLOT`] as a `File` in the child
/// process.
pub fn open_child_end() -> File {
    unsafe { File::from_raw_fd(CHILD_FD_SLOT) }
}

pub fn parent_end(fd: OwnedFd) -> File {
    File::from(fd)
}

/// Parent side: write `READY\n<ip>\n<veth>\n<gateway>` as a single message.
pub fn signal_ready(
    conn: &mut File,
    ip_cidr: &str,
    cont_veth: &str,
    gateway_ip: &str,
) -> Result<(), HandshakeError> {
    let mut message = Vec::from(READY_SENTINEL);
    message.extend_from_slice(ip_cidr.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(cont_veth.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(gateway_ip.as_bytes());
    message.push(b'\n');

    conn.write_all(&message).map_err(HandshakeError::Write)?;
    conn.flush().map_err(HandshakeError::Write)?;
    Ok(())
}

/// Child side: block (with a deadline) on the sentinel plus config, and
/// parse the three LF-separated fields.
pub fn wait_for_ready(
    mut conn: File,
    timeout: Duration,
) -> Result<(String, String, String), HandshakeError> {
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let result = read_ready(&mut conn);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout(timeout)),
    }
}

fn read_ready(conn: &mut File) -> Result<(String, String, String), HandshakeError> {
    let mut sentinel = [0u8; 6];
    read_exact_tracked(conn, &mut sentinel)?;
    if sentinel != *READY_SENTINEL {
        return Err(HandshakeError::SentinelMismatch(sentinel.to_vec()));
    }

    let mut buf = [0u8; MAX_CONFIG_BYTES];
    let n = conn
        .read(&mut buf)
        .map_err(|_| HandshakeError::ShortRead {
            got: 0,
            expected: 1,
        })?;

    let payload = String::from_utf8_lossy(&buf[..n]);
    let fields: Vec<&str> = payload.trim_end_matches('\n').split('\n').collect();
    if fields.len() != 3 {
        return Err(HandshakeError::MalformedConfig(fields.len()));
    }

    Ok((
        fields[0].to_string(),
        fields[1].to_string(),
        fields[2].to_string(),
    ))
}

fn read_exact_tracked(conn: &mut File, buf: &mut [u8]) -> Result<(), HandshakeError> {
    conn.read_exact(buf).map_err(|_| HandshakeError::ShortRead {
        got: 0,
        expected: buf.len(),
    })
}

/// Safety net so a test double can pretend to be the inherited fd without
/// touching global fd 3.
pub fn as_raw(file: &File) -> RawFd {
    file.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::net::UnixStream;

    #[test]
    fn roundtrip_framing_preserves_fields() {
        let (mut parent, child) = UnixStream::pair().unwrap();
        let child_file: File = child.into();

        let handle = std::thread::spawn(move || {
            wait_for_ready(child_file, Duration::from_secs(1)).unwrap()
        });

        let mut message = Vec::from(READY_SENTINEL);
        message.extend_from_slice(b"172.18.0.5/24\nvethc123456\n172.18.0.1\n");
        parent.write_all(&message).unwrap();
        parent.flush().unwrap();
        drop(parent);

        let (ip, veth, gw) = handle.join().unwrap();
        assert_eq!(ip, "172.18.0.5/24");
        assert_eq!(veth, "vethc123456");
        assert_eq!(gw, "172.18.0.1");
    }

    #[test]
    fn sentinel_mismatch_is_fatal() {
        let (mut parent, child) = UnixStream::pair().unwrap();
        let child_file: File = child.into();

        let handle =
            std::thread::spawn(move || wait_for_ready(child_file, Duration::from_secs(1)));

        parent.write_all(b"READX\nbogus\n").unwrap();
        drop(parent);

        assert!(matches!(
            handle.join().unwrap().unwrap_err(),
            HandshakeError::SentinelMismatch(_)
        ));
    }

    #[test]
    fn timeout_fires_when_parent_never_writes() {
        let (parent, child) = UnixStream::pair().unwrap();
        let child_file: File = child.into();

        let result = wait_for_ready(child_file, Duration::from_millis(50));
        drop(parent);

        assert!(matches!(result.unwrap_err(), HandshakeError::Timeout(_)));
    }
}
