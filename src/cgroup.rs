//! Component E: resource limits via a transient systemd scope, applied over
//! the system D-Bus rather than by hand-writing cgroup v2 files. Delegating
//! to systemd gets us correct cleanup for free when the container exits.

use tracing::{debug, info};
use zbus::blocking::Connection;
use zbus::zvariant::Value;

use crate::error::PlumbingError;
use crate::model::RuntimeState;

const SYSTEMD_DEST: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER_IFACE: &str = "org.freedesktop.systemd1.Manager";

/// A live connection to the system bus holding a transient scope for one
/// container. Dropping it (or calling [`CgroupScope::teardown`]) releases
/// our reference to the scope; the scope itself is torn down by systemd
/// once its last process exits.
pub struct CgroupScope {
    _conn: Connection,
    unit: String,
}

impl CgroupScope {
    /// Start a transient scope named `xocker-<pid>.scope`, move `pid` into
    /// it, and cap its CPU quota and memory ceiling.
    pub fn apply(pid: i32, cpu_quota_usec: u64, mem_limit_mib: u64) -> Result<Self, PlumbingError> {
        let conn = Connection::system().map_err(PlumbingError::DbusConnect)?;
        let unit = RuntimeState::scope_unit_for(pid);

        debug!(unit = %unit, pid, cpu_quota_usec, mem_limit_mib, "starting transient cgroup scope");

        let mem_limit_bytes = mem_limit_mib * 1024 * 1024;
        let properties: Vec<(&str, Value)> = vec![
            ("PIDs", Value::from(vec![pid as u32])),
            ("MemoryMax", Value::from(mem_limit_bytes)),
            ("CPUQuotaPerSecUSec", Value::from(cpu_quota_usec)),
        ];
        let aux: Vec<(&str, Vec<(&str, Value)>)> = vec![];

        conn.call_method(
            Some(SYSTEMD_DEST),
            SYSTEMD_PATH,
            Some(SYSTEMD_MANAGER_IFACE),
            "StartTransientUnit",
            &(unit.as_str(), "replace", properties, aux),
        )
        .map_err(|source| PlumbingError::CgroupScope {
            unit: unit.clone(),
            source,
        })?;

        info!(unit = %unit, pid, "cgroup scope applied");
        Ok(Self { _conn: conn, unit })
    }

    pub fn unit_name(&self) -> &str {
        &self.unit
    }

    /// Explicitly drop the bus connection, releasing our reference to the
    /// scope. Equivalent to letting the value go out of scope; kept as a
    /// named call site for the orchestrator's teardown phase.
    pub fn teardown(self) {
        info!(unit = %self.unit, "releasing cgroup scope connection");
    }
}
