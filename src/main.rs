mod bridge;
mod cgroup;
mod cli;
mod error;
mod ipalloc;
mod model;
mod mounts;
mod netns;
mod orchestrator;
mod pty;
mod sync_channel;
mod veth;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Cmd};
use error::RuntimeError;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();

    if orchestrator::is_child_role() {
        let cli = Cli::parse();
        let request = match cli.command {
            Cmd::Run(args) => args.into_request(),
            Cmd::Version => {
                println!(env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
        };

        return match orchestrator::run_child(request) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => report(e),
        };
    }

    let cli = Cli::parse();
    match cli.command {
        Cmd::Run(args) => match orchestrator::run_host(args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => report(e),
        },
        Cmd::Version => {
            println!(env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn report(e: RuntimeError) -> ExitCode {
    let mut message = format!("Error: {e}");
    let mut source = std::error::Error::source(&e);
    while let Some(s) = source {
        message.push_str(": ");
        message.push_str(&s.to_string());
        source = s.source();
    }
    eprintln!("{message}");
    ExitCode::FAILURE
}
