//! # tether

mod audit;
mod cli;
mod core;
mod health;
mod identity;
mod instance;
mod orchestrator;
mod proxy;
mod ssh;
mod stats;
mod supervisor;
mod tunnel;

use std::process::ExitCode;

use cata::execute;
use clap::Parser;
use eyre::Report;
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::Root;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .display_location_section(false)
        .install()
    {
        eprintln!("{err:?}");
        return ExitCode::FAILURE;
    }

    let root = Root::parse();

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let result = tokio::select! {
        _ = sigterm.recv() => Ok(()),
        result = execute(&root) => result,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::from(exit_code(&err))
        }
    }
}

// 0 success, 1 generic failure, 3 rate limited, 4 auth failure. Usage errors
// exit 2 via clap before execution starts.
fn exit_code(err: &Report) -> u8 {
    match err.downcast_ref::<ssh::Error>() {
        Some(ssh::Error::RateLimited(_)) => 3,
        Some(ssh::Error::Auth { .. }) => 4,
        _ => 1,
    }
}
