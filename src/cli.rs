use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Parse a `user:client` pair
fn parse_account(s: &str) -> Result<clientforge::Account, String> {
    clientforge::Account::parse_pair(s)
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(
    name = "clientforge",
    version,
    about = "Provision, patch, re-sign and launch per-identity copies of a single-instance desktop client.",
    after_long_help = "Examples:\n  clientforge hash /Applications/Client.app/Contents/MacOS/Client\n  clientforge patch ./Client --dry-run\n  clientforge launch alice Default --deep-link client://join/42\n  clientforge run alice:Default bob:Default\n  clientforge stop alice\n\n",
    after_help = "\n"
)]
pub(crate) struct Cli {
    /// Print debug diagnostics (same as CLIENTFORGE_VERBOSE=1)
    #[arg(long, global = true)]
    pub(crate) verbose: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum, global = true)]
    pub(crate) color: Option<clientforge::ColorMode>,

    /// Override the data directory (same as CLIENTFORGE_DATA_DIR)
    #[arg(long = "data-dir", global = true)]
    pub(crate) data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Print the code-region fingerprint of a Mach-O executable
    Hash {
        executable: PathBuf,
    },

    /// Apply the patch catalog to an executable in place
    Patch {
        executable: PathBuf,
        /// Patch catalog YAML (defaults to the configured or built-in catalog)
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Report what would change without writing
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// List installed base clients
    Clients {
        /// Rescan the clients directory
        #[arg(long)]
        refresh: bool,
    },

    /// Provision (clone, patch, re-identify) an identity without launching
    Provision {
        user: String,
        client: String,
        /// Client is a wrapped mobile app
        #[arg(long)]
        mobile: bool,
    },

    /// Provision and launch one identity
    Launch {
        user: String,
        client: String,
        /// Deep link passed to the client as its only argument
        #[arg(long = "deep-link")]
        deep_link: Option<String>,
        /// Client is a wrapped mobile app
        #[arg(long)]
        mobile: bool,
    },

    /// Provision several identities in parallel and launch them staggered
    Run {
        /// Identities as user:client; all registered accounts when omitted
        #[arg(value_parser = parse_account)]
        accounts: Vec<clientforge::Account>,
        /// Deep link passed to every client
        #[arg(long = "deep-link")]
        deep_link: Option<String>,
    },

    /// Stop an identity's running client (SIGTERM, then SIGKILL after the grace period)
    Stop {
        user: String,
        /// Grace period before SIGKILL, e.g. 5s (defaults to the configured value)
        #[arg(long, value_parser = parse_duration)]
        grace: Option<Duration>,
    },

    /// Delete an identity's clone so the next launch provisions from scratch
    Reset {
        user: String,
        client: String,
    },
}
