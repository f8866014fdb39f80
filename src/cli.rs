//! Component I: the CLI surface. One binary, a `run` subcommand and a
//! `version` subcommand; `--help`/`--version` text is generated from this
//! module's doc comments rather than hand-written usage strings.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::model::ContainerRequest;

/// A minimal Linux container runtime: namespaces, cgroups, a bridged
/// veth, and an overlay root.
#[derive(Parser, Debug)]
#[command(name = "nsctr", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Run a command inside a new container.
    Run(RunArgs),
    /// Print the runtime version.
    Version,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the root filesystem image.
    #[arg(long)]
    pub rootfs: String,

    /// Keep stdin open and attach a pseudo-terminal.
    #[arg(short, long)]
    pub interactive: bool,

    /// CPU quota in microseconds of CPU time per wall-clock second.
    #[arg(long)]
    pub cpu: Option<u64>,

    /// Memory ceiling in MiB.
    #[arg(long)]
    pub mem: Option<u64>,

    /// Command to execute inside the container.
    #[arg(required = true)]
    pub command: String,

    /// Arguments for the command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl RunArgs {
    /// Re-serialize these args into the flag form the child re-exec
    /// expects: the same flags, a literal `--`, then the user command.
    pub fn to_child_argv(&self) -> Vec<String> {
        let mut argv = vec!["run".to_string(), format!("--rootfs={}", self.rootfs)];
        if self.interactive {
            argv.push("--interactive".to_string());
        }
        if let Some(cpu) = self.cpu {
            argv.push(format!("--cpu={cpu}"));
        }
        if let Some(mem) = self.mem {
            argv.push(format!("--mem={mem}"));
        }
        argv.push("--".to_string());
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Apply defaults and build the immutable request the orchestrator
    /// works with.
    pub fn into_request(self) -> ContainerRequest {
        ContainerRequest {
            cmd: self.command,
            args: self.args,
            rootfs: PathBuf::from(self.rootfs),
            interactive: self.interactive,
            cpu_quota_usec: self.cpu.unwrap_or(ContainerRequest::DEFAULT_CPU_QUOTA_USEC),
            mem_limit_mib: self.mem.unwrap_or(ContainerRequest::DEFAULT_MEM_LIMIT_MIB),
        }
    }
}
