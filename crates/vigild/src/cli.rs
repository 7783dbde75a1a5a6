use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args, Default)]
pub struct ServeArgs {
    #[arg(
        long,
        help = "Address to bind the session API to (overrides [server] bind)"
    )]
    pub bind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ValidateArgs {
    #[arg(help = "Source file to check")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ReplayArgs {
    #[arg(long, help = "Session id to replay")]
    pub session: String,

    #[arg(long, help = "Tracked file path, relative to the project root")]
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Run the session API (default)
    Serve(ServeArgs),
    /// Check one source file for syntax errors, duplicates and arity mismatches
    Validate(ValidateArgs),
    /// List stored sessions
    Sessions,
    /// Recompute regression alerts for one tracked file
    Replay(ReplayArgs),
    /// Abandon idle or full sessions once and exit
    Gc,
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Vigil session integrity daemon")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace holding the .vigil state directory"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}
