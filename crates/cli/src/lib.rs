pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    about = "Concierge operator CLI",
    long_about = "Ask the policy-enforced concierge agent questions, inspect configuration, and check readiness.",
    after_help = "Examples:\n  concierge ask What is the relocation allowance?\n  concierge ask --trace Calculate 2 + 2\n  concierge doctor --json\n  concierge config"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a concierge.toml file (must exist when given)")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Answer one query and print the answer with its sources")]
    Ask {
        #[arg(required = true, num_args = 1.., help = "The question to ask")]
        query: Vec<String>,
        #[arg(long, help = "Emit the full run (state and trace) as JSON")]
        json: bool,
        #[arg(long, help = "Append the execution trace summary")]
        trace: bool,
        #[arg(long = "file", value_name = "PATH", help = "File referenced by the query (repeatable)")]
        files: Vec<PathBuf>,
    },
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Validate config, corpus index, sandbox and calendar store readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Command::Ask { query, json, trace, files } => commands::ask::run(
            commands::ask::AskArgs { query: query.join(" "), json, trace, files },
            config_path,
        ),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(config_path) }
        }
        Command::Doctor { json } => commands::doctor::run(json, config_path),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
