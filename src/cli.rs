use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declare a cloud stack, preview it, converge it", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ./gantry.toml, then ~/.config/gantry/config.toml)
    #[arg(long, global = true, env = "GANTRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// State file, overriding the configured path
    #[arg(long = "state", global = true, env = "GANTRY_STATE")]
    pub state_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what `up` would change, without changing anything
    Preview,

    /// Create or update the stack to match its declaration
    Up(UpArgs),

    /// Delete every resource recorded in state
    Destroy(DestroyArgs),

    /// Show recorded resources
    State(ShowArgs),

    /// Show stack exports from the last successful run
    Outputs(ShowArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct UpArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Maximum resources provisioned at once
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Cancel the run after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Parser)]
pub struct DestroyArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Cancel the run after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Parser)]
pub struct ShowArgs {
    /// Print raw JSON
    #[arg(long)]
    pub json: bool,
}
