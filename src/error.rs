//! Typed error hierarchy. One enum per failure domain (`§7` of the design
//! doc), composed into a single [`RuntimeError`] that `main` knows how to
//! print and map to an exit code.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while allocating or releasing addresses from the
/// file-backed IP pool.
#[derive(Debug, Error)]
pub enum IpAllocError {
    #[error("IP state file {0:?} is empty, no subnet base to derive from")]
    NoSubnetBase(PathBuf),
    #[error("first line of {path:?} ({line:?}) is not a valid IPv4 address")]
    InvalidBase { path: PathBuf, line: String },
    #[error("IP pool in {0:?} is exhausted (all 254 host addresses in use)")]
    Exhausted(PathBuf),
    #[error("I/O error on IP state file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pre-flight errors: anything that can be detected before the child is
/// spawned.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("rootfs {0:?} does not exist or is not a directory")]
    RootfsMissing(PathBuf),
    #[error("failed to resolve rootfs path {0:?}")]
    RootfsUnresolvable(PathBuf, #[source] std::io::Error),
    #[error("failed to initialize IP state")]
    IpState(#[from] IpAllocError),
    #[error("failed to create sync channel")]
    SyncChannel(#[source] nix::Error),
    #[error("failed to create or address the host bridge")]
    Bridge(#[source] std::io::Error),
    #[error("failed to resolve the path to the running executable, needed to re-exec as the namespaced child")]
    SelfExe(#[source] std::io::Error),
}

/// Errors spawning the namespaced child or discovering its grandchild PID.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn unshare for the namespaced child")]
    Spawn(#[source] std::io::Error),
    #[error("timed out after {0:?} waiting for the container PID to appear")]
    DiscoveryTimeout(std::time::Duration),
    #[error("failed to read children of namespace pid {pid}")]
    ChildrenRead {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("container process exited with {0}")]
    ChildFailed(std::process::ExitStatus),
}

/// Errors from host-side plumbing: veth/bridge/cgroup.
#[derive(Debug, Error)]
pub enum PlumbingError {
    #[error("failed to create bridge {0:?}")]
    Bridge(String, #[source] std::io::Error),
    #[error("failed to allocate a container IP")]
    IpAlloc(#[from] IpAllocError),
    #[error("failed to create or attach veth pair")]
    Veth(#[source] std::io::Error),
    #[error("failed to connect to the system D-Bus")]
    DbusConnect(#[source] zbus::Error),
    #[error("StartTransientUnit call for {unit} failed")]
    CgroupScope {
        unit: String,
        #[source]
        source: zbus::Error,
    },
}

/// Handshake errors over the parent/child sync channel.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to write ready signal to sync channel")]
    Write(#[source] std::io::Error),
    #[error("timed out after {0:?} waiting for the ready signal")]
    Timeout(std::time::Duration),
    #[error("ready sentinel mismatch: expected \"READY\\n\", got {0:?}")]
    SentinelMismatch(Vec<u8>),
    #[error("short read on sync channel: got {got} bytes, expected {expected}")]
    ShortRead { got: usize, expected: usize },
    #[error("malformed config payload: expected 3 fields, got {0}")]
    MalformedConfig(usize),
}

/// Mount-namespace errors: overlay, proc, devpts, device nodes, pivot.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to mount {what} at {target:?}")]
    Mount {
        what: &'static str,
        target: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to create device node {0:?}")]
    Mknod(PathBuf, #[source] nix::Error),
    #[error("failed to create directory {0:?}")]
    CreateDir(PathBuf, #[source] std::io::Error),
    #[error("pivot_root into {0:?} failed")]
    PivotRoot(PathBuf, #[source] nix::Error),
    #[error("failed to unmount {0:?}")]
    Unmount(PathBuf, #[source] nix::Error),
    #[error("failed to configure in-namespace networking")]
    Network(#[source] std::io::Error),
}

/// Failure to replace the current process image with the user command.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to exec {0:?}")]
    Exec(String, #[source] nix::Error),
    #[error("failed to spawn {0:?} under a pseudo-terminal")]
    PtySpawn(String, #[source] std::io::Error),
}

/// The top-level error type every fallible entry point returns.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Plumbing(#[from] PlumbingError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
