//! Component H: the orchestrator. Owns the parent-side state machine
//! (phases 1-6 of `§4.H`) and the child-side state machine, and re-invokes
//! the binary itself as the child via `unshare`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::bridge::{self, BRIDGE_NAME, GATEWAY_CIDR, GATEWAY_IP};
use crate::cgroup::CgroupScope;
use crate::cli::RunArgs;
use crate::error::{PreflightError, Result, RuntimeError, SpawnError};
use crate::ipalloc;
use crate::model::{ContainerRequest, OverlayLayout, RuntimeState};
use crate::mounts;
use crate::netns;
use crate::pty;
use crate::sync_channel::{self, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::veth;

/// Sentinel environment variable that marks the re-exec'd process as the
/// child role.
pub const IN_CONTAINER_ENV: &str = "_IN_CONTAINER";

/// Default location of the IP state file: relative to the invocation
/// directory, per the design doc.
pub const IP_STATE_PATH: &str = "./ip.state";

const PID_DISCOVERY_INTERVAL: Duration = Duration::from_millis(10);
const PID_DISCOVERY_DEADLINE: Duration = Duration::from_secs(3);

pub fn is_child_role() -> bool {
    std::env::var(IN_CONTAINER_ENV).as_deref() == Ok("1")
}

/// Phase 1-6: the parent-side state machine. Returns once the spawned
/// container process has exited successfully; a non-zero exit is
/// reported as [`SpawnError::ChildFailed`].
pub fn run_host(args: RunArgs) -> Result<()> {
    let ip_state_path = PathBuf::from(IP_STATE_PATH);
    let mut state = RuntimeState::default();

    // --- Phase 1: pre-flight -------------------------------------------
    let rootfs = preflight(&args.rootfs, &ip_state_path)?;

    let (parent_fd, child_fd) = sync_channel::create_pair().map_err(PreflightError::SyncChannel)?;

    // --- Phase 2: spawn --------------------------------------------------
    let self_exe = std::env::current_exe().map_err(PreflightError::SelfExe)?;

    let mut child_args = args.clone();
    child_args.rootfs = rootfs.to_string_lossy().to_string();

    let mut cmd = Command::new("unshare");
    cmd.args([
        "--mount",
        "--uts",
        "--ipc",
        "--net",
        "--pid",
        "--fork",
        "--mount-proc",
        "--",
    ])
    .arg(&self_exe)
    .args(child_args.to_child_argv())
    .env(IN_CONTAINER_ENV, "1")
    .stdin(Stdio::inherit())
    .stdout(Stdio::inherit())
    .stderr(Stdio::inherit());

    sync_channel::inherit_into_child(&mut cmd, child_fd);

    let mut child_process = cmd.spawn().map_err(SpawnError::Spawn)?;
    let namespace_pid = child_process.id() as i32;
    state.namespace_pid = Some(namespace_pid);
    info!(namespace_pid, "spawned namespaced child");

    let mut parent_conn = sync_channel::parent_end(parent_fd);

    // --- Phase 3: PID discovery ------------------------------------------
    let container_pid = match discover_container_pid(namespace_pid) {
        Ok(pid) => pid,
        Err(e) => {
            let _ = child_process.kill();
            let _ = child_process.wait();
            return Err(e.into());
        }
    };
    state.container_pid = Some(container_pid);
    info!(container_pid, "discovered container init pid");

    // --- Phase 4: host-side plumbing --------------------------------------
    let cgroup_scope = match run_plumbing(&ip_state_path, container_pid, &args, &mut child_process, &mut state) {
        Ok(scope) => scope,
        Err(e) => return Err(e),
    };
    debug!(
        container_ip = ?state.container_ip,
        host_veth = ?state.host_veth,
        cont_veth = ?state.cont_veth,
        scope_unit = ?state.scope_unit,
        "host-side plumbing complete"
    );

    // --- Phase 5: release --------------------------------------------------
    state.gateway_ip = Some(GATEWAY_IP.to_string());
    let container_ip = state.container_ip.clone().expect("set by run_plumbing");
    let cont_veth = state.cont_veth.clone().expect("set by run_plumbing");

    if let Err(e) =
        sync_channel::signal_ready(&mut parent_conn, &container_ip, &cont_veth, GATEWAY_IP)
    {
        let _ = child_process.kill();
        let _ = child_process.wait();
        release_ip(&ip_state_path, &container_ip);
        cgroup_scope.teardown();
        return Err(e.into());
    }

    // --- Phase 6: wait -------------------------------------------------------
    let status = child_process.wait().map_err(SpawnError::Spawn)?;
    release_ip(&ip_state_path, &container_ip);
    cgroup_scope.teardown();

    if !status.success() {
        warn!(%status, "container process exited with failure");
        return Err(SpawnError::ChildFailed(status).into());
    }

    Ok(())
}

/// Diagnostic only: log how many processes the host currently sees,
/// by piping `ps aux` into `wc -l`. Failures here are never fatal.
fn log_process_count() {
    let mut ps = match Command::new("ps").arg("aux").stdout(Stdio::piped()).spawn() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to spawn ps for diagnostic process count");
            return;
        }
    };
    let Some(ps_stdout) = ps.stdout.take() else {
        return;
    };

    match Command::new("wc").arg("-l").stdin(ps_stdout).output() {
        Ok(output) => {
            debug!(count = %String::from_utf8_lossy(&output.stdout).trim(), "ps aux process count");
        }
        Err(e) => warn!(error = %e, "failed to run wc for diagnostic process count"),
    }
    let _ = ps.wait();
}

fn preflight(rootfs: &str, ip_state_path: &Path) -> Result<PathBuf> {
    log_process_count();

    let raw = PathBuf::from(rootfs);
    let absolute = fs::canonicalize(&raw)
        .map_err(|source| PreflightError::RootfsUnresolvable(raw.clone(), source))?;
    if !absolute.is_dir() {
        return Err(PreflightError::RootfsMissing(absolute).into());
    }

    ipalloc::init(ip_state_path).map_err(PreflightError::from)?;
    bridge::ensure_bridge(BRIDGE_NAME, GATEWAY_CIDR).map_err(PreflightError::Bridge)?;

    Ok(absolute)
}

fn discover_container_pid(namespace_pid: i32) -> std::result::Result<i32, SpawnError> {
    let children_path = format!("/proc/{namespace_pid}/task/{namespace_pid}/children");
    let deadline = Instant::now() + PID_DISCOVERY_DEADLINE;

    loop {
        match fs::read_to_string(&children_path) {
            Ok(contents) => {
                if let Some(first) = contents.split_whitespace().next() {
                    if let Ok(pid) = first.parse::<i32>() {
                        return Ok(pid);
                    }
                }
            }
            Err(source) => {
                if Instant::now() >= deadline {
                    return Err(SpawnError::ChildrenRead {
                        pid: namespace_pid,
                        source,
                    });
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(SpawnError::DiscoveryTimeout(PID_DISCOVERY_DEADLINE));
        }
        std::thread::sleep(PID_DISCOVERY_INTERVAL);
    }
}

fn run_plumbing(
    ip_state_path: &Path,
    container_pid: i32,
    args: &RunArgs,
    child_process: &mut std::process::Child,
    state: &mut RuntimeState,
) -> Result<CgroupScope> {
    let (ip_cidr, host_veth, cont_veth) = veth::create_and_attach(ip_state_path, container_pid)
        .map_err(RuntimeError::Plumbing)
        .inspect_err(|_| {
            let _ = child_process.kill();
            let _ = child_process.wait();
        })?;
    state.container_ip = Some(ip_cidr.clone());
    state.host_veth = Some(host_veth);
    state.cont_veth = Some(cont_veth);

    let cpu = args
        .cpu
        .unwrap_or(ContainerRequest::DEFAULT_CPU_QUOTA_USEC);
    let mem = args.mem.unwrap_or(ContainerRequest::DEFAULT_MEM_LIMIT_MIB);

    let scope = CgroupScope::apply(container_pid, cpu, mem).map_err(|e| {
        let _ = child_process.kill();
        let _ = child_process.wait();
        ipalloc::release(ip_state_path, &strip_cidr(&ip_cidr)).ok();
        RuntimeError::Plumbing(e)
    })?;
    state.scope_unit = Some(scope.unit_name().to_string());

    Ok(scope)
}

fn strip_cidr(ip_cidr: &str) -> String {
    ip_cidr.split('/').next().unwrap_or(ip_cidr).to_string()
}

fn release_ip(ip_state_path: &Path, ip_cidr: &str) {
    let addr = strip_cidr(ip_cidr);
    if let Err(e) = ipalloc::release(ip_state_path, &addr) {
        error!(error = %e, %addr, "failed to release container IP");
    }
}

/// The child-side state machine. Only returns on failure; success ends in
/// an `exec` that replaces this process image.
pub fn run_child(request: ContainerRequest) -> Result<()> {
    let layout = OverlayLayout::derive(&request.rootfs);

    // 2.1-2.4: overlay, proc, dev, devpts, device nodes.
    mounts::mount_overlay(&layout)?;
    mounts::mount_pseudo_fs(&layout.merged)?;
    mounts::mount_devpts(&layout.merged)?;
    mounts::create_device_nodes(&layout.merged)?;
    debug!("mount stage (pre-pivot) complete");

    // 3: wait for the ready signal.
    let conn = sync_channel::open_child_end();
    let (ip_cidr, cont_veth, gateway_ip) =
        sync_channel::wait_for_ready(conn, DEFAULT_HANDSHAKE_TIMEOUT)?;
    info!(ip = %ip_cidr, veth = %cont_veth, gateway = %gateway_ip, "received container network config");

    // 4: configure in-namespace networking.
    netns::configure(&cont_veth, &ip_cidr, &gateway_ip)?;

    // 5-6: bind self, pivot.
    mounts::bind_self(&layout.merged)?;
    mounts::pivot(&layout)?;
    debug!("pivot_root complete");

    set_hostname();

    // 7: exec the user command.
    exec_user_command(&request)
}

fn set_hostname() {
    // Spec requires the host `hostname` utility rather than the
    // sethostname(2) syscall directly, so this stays an external command
    // like the rest of the network plumbing.
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = format!("container_{ts}");
    if let Err(e) = Command::new("hostname").arg(&name).status() {
        warn!(error = %e, hostname = %name, "failed to set hostname");
    }
}

fn exec_user_command(request: &ContainerRequest) -> Result<()> {
    if request.interactive {
        pty::run_interactive(&request.cmd, &request.args)
            .map_err(RuntimeError::Exec)?;
        Ok(())
    } else {
        use std::ffi::CString;
        let cmd_c = CString::new(request.cmd.as_str())
            .expect("command path has no interior NUL");
        let mut argv = vec![cmd_c.clone()];
        for a in &request.args {
            argv.push(CString::new(a.as_str()).expect("argument has no interior NUL"));
        }
        let env: Vec<CString> = Vec::new();
        let err = nix::unistd::execve(&cmd_c, &argv, &env).unwrap_err();
        Err(crate::error::ExecError::Exec(request.cmd.clone(), err).into())
    }
}
