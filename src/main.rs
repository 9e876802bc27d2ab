mod cli;
mod commands;
mod config;
mod program;
mod progress;
mod sandbox;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    /// Explicit config file, if given
    pub config: Option<PathBuf>,
    /// State file override
    pub state: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
        state: cli.state_file,
    };

    match cli.command {
        Command::Preview => commands::deploy::preview(&ctx),
        Command::Up(args) => commands::deploy::up(&ctx, &args),
        Command::Destroy(args) => commands::deploy::destroy(&ctx, &args),
        Command::State(args) => commands::state::show(&ctx, &args),
        Command::Outputs(args) => commands::state::outputs(&ctx, &args),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "gantry", &mut io::stdout());
            Ok(())
        }
    }
}
