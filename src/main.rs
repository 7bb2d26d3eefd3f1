mod aggregate;
mod command;
mod controller;
mod device;
mod ffprobe;
mod float;
mod log;
mod matcher;
mod metric;
mod process;
mod provision;
mod registry;
mod result;
mod scorer;
mod temporary;

use anyhow::anyhow;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Keep temporary files after exiting.
    #[arg(long, global = true)]
    keep: bool,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(clap::Subcommand)]
enum Command {
    Run(command::run::Args),
    Aggregate(command::aggregate::Args),
    Modes(command::modes::Args),
    PrintCompletions(command::print_completions::Args),
}

impl Command {
    fn set_quiet(&mut self, quiet: bool) {
        match self {
            Self::Run(args) => args.quiet = quiet,
            Self::Aggregate(args) => args.quiet = quiet,
            Self::Modes(_) | Self::PrintCompletions(_) => {}
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let Cli {
        command: mut cmd,
        keep,
        verbose,
    } = Cli::parse();

    env_logger::Builder::new()
        .filter_level(verbose.log_level_filter())
        .parse_default_env()
        .format_timestamp(None)
        .init();
    cmd.set_quiet(verbose.log_level_filter() < ::log::LevelFilter::Info);

    let action = async {
        match cmd {
            Command::Run(args) => command::run(args).await,
            Command::Aggregate(args) => command::aggregate(args).await,
            Command::Modes(args) => command::modes(args),
            Command::PrintCompletions(args) => command::print_completions(args),
        }
    };
    let out = tokio::select! {
        r = action => r,
        _ = signal::ctrl_c() => Err(anyhow!("ctrl_c")),
    };

    if !keep {
        tokio::time::timeout(Duration::from_secs(2), temporary::clean())
            .await
            .unwrap_or_else(|_| ::log::warn!("temp cleanup timed out"));
    }

    if let Err(err) = out {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
