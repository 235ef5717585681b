use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, bail};
use tracing::{debug, info};

use mau_core::account::{Account, AccountError, Friend};
use mau_core::fingerprint::Fingerprint;
use mau_core::transport::Listener;
use mau_engine::{
    Client, FingerprintResolver, LocalFriendAddress, ServeConfig, Server, StaticAddress, SyncConfig,
    SyncContext,
};

use crate::{Args, Command, ui};

/// Executes the parsed command line.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let Args {
        root,
        passphrase,
        command,
    } = args;
    let unlock = || -> anyhow::Result<Account> {
        let Some(passphrase) = passphrase.as_deref() else {
            bail!("a passphrase is required: set MAU_PASSPHRASE or pass --passphrase");
        };
        Account::open(&root, passphrase).with_context(|| format!("cannot open account in {}", root.display()))
    };

    match command {
        Command::Init { name, email } => {
            let Some(passphrase) = passphrase.as_deref() else {
                bail!("choose a passphrase: set MAU_PASSPHRASE or pass --passphrase");
            };
            let account = Account::create(&root, &name, &email, passphrase)?;
            println!("  ✅ Account created for {name} <{email}>");
            println!("  Fingerprint: {}", account.fingerprint());
        }
        Command::Whoami => {
            let (fingerprint, name, email) = Account::peek(&root)?;
            println!("  {name} <{email}>");
            println!("  Fingerprint: {fingerprint}");
        }
        Command::Export { out } => {
            let identity = unlock()?.export()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &identity)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    println!("  📤 Identity written to {}", path.display());
                }
                None => std::io::stdout().write_all(&identity)?,
            }
        }
        Command::AddFriend { file } => {
            let account = unlock()?;
            let reader = std::fs::File::open(&file).with_context(|| format!("cannot read {}", file.display()))?;
            let friend = account.add_friend(reader)?;
            println!("  🤝 Added {} <{}>", friend.name(), friend.email());
            println!("  Fingerprint: {}", friend.fingerprint());
            println!("  Run `mau follow {}` to sync from them.", friend.fingerprint());
        }
        Command::RemoveFriend { fingerprint } => {
            unlock()?.remove_friend(&fingerprint)?;
            println!("  Removed {fingerprint}");
        }
        Command::Follow { fingerprint } => {
            unlock()?.follow(&fingerprint)?;
            println!("  Following {fingerprint}");
        }
        Command::Unfollow { fingerprint } => {
            unlock()?.unfollow(&fingerprint)?;
            println!("  No longer following {fingerprint}");
        }
        Command::Friends => ui::print_friends(&unlock()?.friends()),
        Command::Publish {
            path,
            recipients,
            name,
        } => publish(&unlock()?, &path, &recipients, name.as_deref())?,
        Command::Files { from } => {
            let account = unlock()?;
            let owner = from.unwrap_or_else(|| account.fingerprint());
            ui::print_files(&account.files_of(&owner, UNIX_EPOCH)?);
        }
        Command::Cat { name, from } => {
            let account = unlock()?;
            let owner = from.unwrap_or_else(|| account.fingerprint());
            let content = account.read_file(&owner, &name)?;
            std::io::stdout().write_all(&content)?;
        }
        Command::Serve {
            listen,
            no_advertise,
        } => serve(unlock()?, &listen, !no_advertise).await?,
        Command::Sync {
            fingerprint,
            since,
            addresses,
            no_discovery,
            timeout,
        } => {
            let ctx = SyncContext::with_timeout(Duration::from_secs(timeout));
            let since = UNIX_EPOCH + Duration::from_secs(since.unwrap_or(0));
            sync(unlock()?, &ctx, &fingerprint, since, addresses, !no_discovery).await?;
        }
    }
    Ok(())
}

fn publish(account: &Account, path: &Path, recipients: &[Fingerprint], name: Option<&str>) -> anyhow::Result<()> {
    let friends = recipients
        .iter()
        .map(|fp| account.friend(fp).ok_or(AccountError::FriendNotFound(*fp)))
        .collect::<Result<Vec<Friend>, _>>()?;

    let name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name, pass --name", path.display()))?,
    };
    let reader = std::fs::File::open(path).with_context(|| format!("cannot read {}", path.display()))?;
    let record = account.add_file(reader, name, &friends)?;

    println!("  📦 Published \"{}\" ({})", record.name, ui::format_size(record.size));
    if friends.is_empty() {
        println!("  Readable by you only");
    }
    for friend in &friends {
        println!("  Readable by {} <{}>", friend.name(), friend.email());
    }
    Ok(())
}

async fn serve(account: Account, listen: &str, advertise: bool) -> anyhow::Result<()> {
    let account = Arc::new(account);
    let config = ServeConfig {
        advertise,
        ..ServeConfig::default()
    };
    let server = Server::new(Arc::clone(&account), config)?;
    let listener = server.bind(listen).await?;
    ui::print_banner(&account, &listener.local_addr(), advertise);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    server.serve(listener).await?;
    println!("  Bye! 👋");
    Ok(())
}

async fn sync(
    account: Account,
    ctx: &SyncContext,
    fingerprint: &Fingerprint,
    since: std::time::SystemTime,
    addresses: Vec<String>,
    discover: bool,
) -> anyhow::Result<()> {
    let client = Client::new(Arc::new(account), SyncConfig::default())?;

    let statics: Vec<StaticAddress> = addresses.into_iter().map(StaticAddress::new).collect();
    let local = LocalFriendAddress::default();
    let mut resolvers: Vec<&dyn FingerprintResolver> =
        statics.iter().map(|r| r as &dyn FingerprintResolver).collect();
    if discover {
        resolvers.push(&local);
    }
    debug!(resolvers = resolvers.len(), "Resolvers configured");

    let cancel = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    println!("  🔄 Syncing from {fingerprint}...");
    let report = client.download_friend(ctx, fingerprint, since, &resolvers).await?;
    ui::print_report(&report);
    Ok(())
}
