//! Component G: the child-only mount stage — overlay, proc, dev, devpts,
//! device nodes, bind-to-self, and the final pivot_root. Order matters:
//! `/proc` must exist before the parent can read the child's PID tree,
//! `devpts` must exist before any PTY is allocated, and the merged
//! directory must be bind-mounted onto itself before `pivot_root` will
//! accept it as the new root.

use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{fchmodat, mknod, FchmodatFlags, Mode, SFlag};
use nix::unistd::{chdir, pivot_root};

use crate::error::MountError;
use crate::model::OverlayLayout;

fn create_dir(path: &Path) -> Result<(), MountError> {
    create_dir_all(path).map_err(|source| MountError::CreateDir(path.to_path_buf(), source))
}

fn do_mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
    what: &'static str,
) -> Result<(), MountError> {
    mount(source, target, fstype, flags, data).map_err(|source| MountError::Mount {
        what,
        target: target.to_path_buf(),
        source,
    })
}

/// Step 1: mount the overlay (lower = rootfs image, upper/work = siblings
/// of it) at the merged mountpoint. All later mounts in this stage target
/// `layout.merged`.
pub fn mount_overlay(layout: &OverlayLayout) -> Result<(), MountError> {
    create_dir(&layout.upper)?;
    create_dir(&layout.work)?;
    create_dir(&layout.merged)?;

    let opts = layout.overlay_mount_options();
    do_mount(
        Some("overlay"),
        &layout.merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
        "overlay",
    )
}

/// Step 2: mount `proc` and a `tmpfs` for `/dev`, both under the merged
/// root.
pub fn mount_pseudo_fs(merged: &Path) -> Result<(), MountError> {
    let proc_path = merged.join("proc");
    create_dir(&proc_path)?;
    do_mount(
        Some("proc"),
        &proc_path,
        Some("proc"),
        MsFlags::empty(),
        None,
        "proc",
    )?;

    let dev_path = merged.join("dev");
    create_dir(&dev_path)?;
    do_mount(
        Some("tmpfs"),
        &dev_path,
        Some("tmpfs"),
        MsFlags::empty(),
        None,
        "tmpfs /dev",
    )
}

/// Step 3: mount a fresh devpts instance at `<merged>/dev/pts`.
pub fn mount_devpts(merged: &Path) -> Result<(), MountError> {
    let pts_path = merged.join("dev").join("pts");
    create_dir(&pts_path)?;
    do_mount(
        Some("devpts"),
        &pts_path,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=620,gid=5"),
        "devpts",
    )
}

struct DeviceNode {
    name: &'static str,
    major: u64,
    minor: u64,
}

const DEVICE_NODES: &[DeviceNode] = &[
    DeviceNode { name: "tty", major: 5, minor: 0 },
    DeviceNode { name: "ptmx", major: 5, minor: 2 },
    DeviceNode { name: "null", major: 1, minor: 3 },
    DeviceNode { name: "zero", major: 1, minor: 5 },
    DeviceNode { name: "random", major: 1, minor: 8 },
    DeviceNode { name: "urandom", major: 1, minor: 9 },
];

/// Step 4: create the standard character device nodes under
/// `<merged>/dev`, if not already present. Existing nodes are left alone.
pub fn create_device_nodes(merged: &Path) -> Result<(), MountError> {
    let dev_dir = merged.join("dev");
    for node in DEVICE_NODES {
        let path = dev_dir.join(node.name);
        if path.exists() {
            continue;
        }
        let dev = nix::sys::stat::makedev(node.major, node.minor);
        let perm = Mode::from_bits_truncate(0o666);
        mknod(&path, SFlag::S_IFCHR, perm, dev)
            .map_err(|source| MountError::Mknod(path.clone(), source))?;

        // mknod's mode is masked by the process umask, so the node can come
        // out narrower than requested; force it back to 0o666 explicitly.
        fchmodat(None, &path, perm, FchmodatFlags::FollowSymlink)
            .map_err(|source| MountError::Mknod(path.clone(), source))?;
    }
    Ok(())
}

/// Step 5: bind-mount the merged root onto itself (recursively), which
/// `pivot_root` requires of its new-root argument.
pub fn bind_self(merged: &Path) -> Result<(), MountError> {
    do_mount(
        None,
        merged,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
        "bind self",
    )
}

/// Step 6: pivot into the merged root, chdir to `/`, and detach-unmount
/// the old root now parked at `old_root`.
pub fn pivot(layout: &OverlayLayout) -> Result<(), MountError> {
    let old_root = layout.old_root();
    create_dir(&old_root)?;

    pivot_root(&layout.merged, &old_root)
        .map_err(|source| MountError::PivotRoot(layout.merged.clone(), source))?;

    chdir("/").map_err(|source| MountError::PivotRoot(PathBuf::from("/"), source))?;

    let relative_old_root = Path::new("/old_root");
    umount2(relative_old_root, MntFlags::MNT_DETACH)
        .map_err(|source| MountError::Unmount(relative_old_root.to_path_buf(), source))?;

    Ok(())
}
