mod command;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use mau_core::fingerprint::Fingerprint;

/// mau: share encrypted files with the friends you choose.
///
/// Every account lives in a directory (`--root`). Files you publish are
/// encrypted for the friends you name; friends you follow can be synced from
/// over QUIC, either at a known address or found on the local network.
#[derive(Parser, Debug)]
#[command(name = "mau", version, about)]
struct Args {
    /// Account directory.
    #[arg(short, long, env = "MAU_ROOT", default_value = ".")]
    root: PathBuf,

    /// Passphrase protecting the account key.
    #[arg(long, env = "MAU_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new account in the root directory.
    Init {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Show this account's identity.
    Whoami,
    /// Write this account's identity for friends to import.
    Export {
        /// Output file; stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Import a friend's exported identity.
    AddFriend { file: PathBuf },
    /// Forget a friend and stop following it.
    RemoveFriend { fingerprint: Fingerprint },
    /// Allow syncing from a friend.
    Follow { fingerprint: Fingerprint },
    /// Stop syncing from a friend.
    Unfollow { fingerprint: Fingerprint },
    /// List friends and their trust state.
    Friends,
    /// Encrypt a file and publish it.
    Publish {
        path: PathBuf,
        /// Friends allowed to read it. Only you can when none are given.
        #[arg(long = "to")]
        recipients: Vec<Fingerprint>,
        /// Published name; defaults to the file name of `path`.
        #[arg(long)]
        name: Option<String>,
    },
    /// List published files, or files downloaded from a friend.
    Files {
        #[arg(long)]
        from: Option<Fingerprint>,
    },
    /// Decrypt a stored file to stdout.
    Cat {
        name: String,
        /// Owner of the file; yourself when omitted.
        #[arg(long)]
        from: Option<Fingerprint>,
    },
    /// Serve published files until interrupted.
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:4242")]
        listen: String,
        /// Do not announce the account on the local network.
        #[arg(long)]
        no_advertise: bool,
    },
    /// Download new files from a followed friend.
    Sync {
        fingerprint: Fingerprint,
        /// Only fetch files newer than this Unix timestamp (seconds).
        #[arg(long)]
        since: Option<u64>,
        /// Addresses to try, in order, before local discovery.
        #[arg(long = "address")]
        addresses: Vec<String>,
        /// Skip local network discovery.
        #[arg(long)]
        no_discovery: bool,
        /// Overall time limit in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr so they never mix with command output on stdout.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mau_cli=info,warn")),
        )
        .init();

    if let Err(e) = command::run(args).await {
        eprintln!("  ❌ {e:#}");
        std::process::exit(1);
    }
}
