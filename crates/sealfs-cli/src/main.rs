//! Command-line front end for SealFS vaults.

mod commands;
mod keyfile;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sealfs")]
#[command(author, version, about = "Encrypted overlay filesystem")]
#[command(propagate_version = true)]
struct Cli {
    /// Vault passphrase (insecure; prefer the interactive prompt or the
    /// SEALFS_PASSWORD environment variable)
    #[arg(long, env = "SEALFS_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault
    Init(commands::init::Args),

    /// Mount a vault
    Mount(commands::mount::Args),

    /// Show vault parameters
    Info(commands::info::Args),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn passphrase(given: &Option<String>) -> Result<String> {
    if let Some(password) = given {
        return Ok(password.clone());
    }
    Ok(rpassword::prompt_password("Passphrase: ")?)
}

fn new_passphrase(given: &Option<String>) -> Result<String> {
    if let Some(password) = given {
        return Ok(password.clone());
    }
    let first = rpassword::prompt_password("New passphrase: ")?;
    if first.is_empty() {
        bail!("passphrase must not be empty");
    }
    let second = rpassword::prompt_password("Repeat passphrase: ")?;
    if first != second {
        bail!("passphrases do not match");
    }
    Ok(first)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init(args) => {
            let pass = new_passphrase(&cli.password)?;
            commands::init::run(args, &pass)
        }
        Commands::Mount(args) => {
            let pass = passphrase(&cli.password)?;
            commands::mount::run(args, &pass)
        }
        Commands::Info(args) => commands::info::run(args),
    }
}
