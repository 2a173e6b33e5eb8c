use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::shell::{ProcessRegistry, ShellExecutor};

#[derive(Args)]
pub struct ExecArgs {
    /// Command line to execute through the sandbox shell
    pub command: String,

    /// Timeout in seconds (defaults to the configured deadline)
    #[arg(short, long)]
    pub timeout: Option<u64>,
}

pub async fn run(args: ExecArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load(config_path)?;
    let executor = ShellExecutor::new(&config.sandbox, ProcessRegistry::new());

    let outcome = executor.execute(&args.command, args.timeout).await;

    if !outcome.output.is_empty() {
        print!("{}", outcome.output);
    }
    if let Some(error) = &outcome.error {
        eprintln!("{error}");
    }

    // Spawn failures and forced terminations report -1; surface those as
    // a plain failure to the calling shell.
    let code = if outcome.exit_code < 0 {
        1
    } else {
        outcome.exit_code.min(255)
    };
    std::process::exit(code)
}
