use boardlink::BoardClass;
use boardlink::error::BoardResult;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Board type
    #[arg(short, long, global = true, default_value = "pyboard")]
    board: BoardClass,

    /// Serial port; found by USB ids when omitted
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List serial ports and the board classes they may host
    #[command(name = "list", alias = "l")]
    List {
        /// Include ports whose USB ids are not known to work
        #[arg(short, long)]
        all: bool,
    },

    /// Show what the board reports about itself
    Info,

    /// List files on the board
    Ls {
        #[arg(default_value = "")]
        dir: String,
    },

    /// Copy a local file to the board
    Put {
        local: PathBuf,
        /// Target path; defaults to the local file name
        remote: Option<String>,
    },

    /// Copy a file from the board; prints to stdout without a local path
    Get { remote: String, local: Option<PathBuf> },

    /// Remove a file from the board
    Rm { remote: String },

    /// Run a program stored on the board
    Run {
        remote: String,
        /// Wait for the program to end
        #[arg(short, long)]
        wait: bool,
    },

    /// Stop the running program
    Stop,

    /// Write a firmware bundle (zip archive or directory)
    #[command(name = "firmware", alias = "fw")]
    Firmware { bundle: PathBuf },
}

fn main() -> BoardResult<()> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let target = commands::Target {
        board: cli.board,
        port: cli.port,
    };
    match cli.command {
        Command::List { all } => commands::list(all)?,
        Command::Info => commands::info(&target)?,
        Command::Ls { dir } => commands::ls(&target, &dir)?,
        Command::Put { local, remote } => commands::put(&target, &local, remote.as_deref())?,
        Command::Get { remote, local } => commands::get(&target, &remote, local.as_deref())?,
        Command::Rm { remote } => commands::rm(&target, &remote)?,
        Command::Run { remote, wait } => commands::run(&target, &remote, wait)?,
        Command::Stop => commands::stop(&target)?,
        Command::Firmware { bundle } => commands::firmware(&target, &bundle)?,
    }

    Ok(())
}
