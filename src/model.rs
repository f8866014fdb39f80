//! Data types shared between the parent and child state machines.

use std::path::{Path, PathBuf};

/// A fully-resolved request to run one container. Immutable once built by
/// the CLI layer; the orchestrator never mutates it.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub cmd: String,
    pub args: Vec<String>,
    pub rootfs: PathBuf,
    pub interactive: bool,
    pub cpu_quota_usec: u64,
    pub mem_limit_mib: u64,
}

impl ContainerRequest {
    pub const DEFAULT_CPU_QUOTA_USEC: u64 = 500_000;
    pub const DEFAULT_MEM_LIMIT_MIB: u64 = 128;
}

/// Parent-side bookkeeping for one container's lifetime. Populated
/// incrementally as the parent state machine advances.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub namespace_pid: Option<i32>,
    pub container_pid: Option<i32>,
    pub container_ip: Option<String>,
    pub host_veth: Option<String>,
    pub cont_veth: Option<String>,
    pub gateway_ip: Option<String>,
    pub scope_unit: Option<String>,
}

impl RuntimeState {
    pub fn scope_unit_for(pid: i32) -> String {
        format!("xocker-{pid}.scope")
    }
}

/// Sibling-directory layout for the overlay filesystem, derived purely from
/// the rootfs path: `rootfs = /X/image` yields `/X/overlay/{upper,work}`
/// and `/X/merged`.
#[derive(Debug, Clone)]
pub struct OverlayLayout {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlayLayout {
    pub fn derive(rootfs: &Path) -> Self {
        let parent = rootfs.parent().unwrap_or_else(|| Path::new("/"));
        Self {
            lower: rootfs.to_path_buf(),
            upper: parent.join("overlay").join("upper"),
            work: parent.join("overlay").join("work"),
            merged: parent.join("merged"),
        }
    }

    pub fn old_root(&self) -> PathBuf {
        self.merged.join("old_root")
    }

    pub fn overlay_mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }
}
