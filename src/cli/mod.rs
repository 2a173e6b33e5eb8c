pub mod exec;
pub mod serve;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(author, version, about = "Sandboxed shell execution and service supervision daemon")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "SANDBOXD_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API daemon
    Serve(serve::ServeArgs),

    /// Execute a single command in the sandbox and print its output
    Exec(exec::ExecArgs),
}
