//! sbx: strongbox command-line client
//!
//! Commands:
//!   remote set <addr> / remote show  - configure the sync server
//!   login -u <user> [-p <pass>]      - register or log in, store the token
//!   add card|logpass|file ...        - encrypt and store a secret
//!   rm <id>                          - delete a secret
//!   show <id> [-o <path>]            - decrypt a secret to stdout or a file
//!   ls                               - list live secrets
//!   sync                             - reconcile with the server

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sbx_core::config::{expand_tilde, SbxConfig};
use sbx_crypto::{PassphraseProvider, StaticPassphrase, TerminalPrompt};
use sbx_sync::{sync_vault, RemoteClient, SyncOutcome};
use sbx_vault::{BankCard, LoginPassword, Secret, SecretRecord, Vault};
use secrecy::ExposeSecret;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Environment variable consulted before prompting for the vault passphrase.
const PASSPHRASE_ENV: &str = "SBX_PASSPHRASE";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sbx",
    version,
    about = "strongbox secret vault",
    long_about = "sbx: keep cards, logins and files encrypted locally and in sync across devices"
)]
struct Cli {
    /// Path to strongbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SBX_CONFIG",
        default_value = "~/.strongbox/strongbox.toml"
    )]
    config: PathBuf,

    /// Log level for diagnostics on stderr
    #[arg(long, env = "SBX_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync server settings
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },

    /// Register or log in on the sync server
    Login {
        #[arg(long, short = 'u')]
        username: String,
        /// Prompted for when omitted
        #[arg(long, short = 'p')]
        password: Option<String>,
    },

    /// Add a secret, or overwrite one with --id
    Add {
        #[command(subcommand)]
        kind: AddKind,
    },

    /// Delete a secret
    #[command(alias = "delete")]
    Rm { id: String },

    /// Reconcile the local vault with the server
    Sync,

    /// Decrypt a secret
    Show {
        id: String,
        /// Write to this file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// List secrets
    #[command(alias = "list")]
    Ls,
}

#[derive(Subcommand, Debug)]
enum RemoteAction {
    /// Set the server address (host:port or URL)
    Set { address: String },
    /// Print the configured server
    Show,
}

#[derive(clap::Args, Debug)]
struct AddOptions {
    /// Free-form description
    #[arg(long, short = 'd', default_value = "")]
    description: String,
    /// Overwrite the secret with this ID instead of adding a new one
    #[arg(long)]
    id: Option<String>,
}

#[derive(Subcommand, Debug)]
enum AddKind {
    /// Bank card number (16 digits, spaces or hyphens allowed)
    Card {
        number: String,
        #[command(flatten)]
        opts: AddOptions,
    },
    /// Login and password pair
    Logpass {
        username: String,
        password: String,
        #[command(flatten)]
        opts: AddOptions,
    },
    /// Contents of a local file
    File {
        path: PathBuf,
        #[command(flatten)]
        opts: AddOptions,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config_path = expand_tilde(&cli.config);
    let config = SbxConfig::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let mut vault = open_vault(&config)?;

    match cli.command {
        Commands::Remote {
            action: RemoteAction::Set { address },
        } => cmd_remote_set(&mut vault, &address),
        Commands::Remote {
            action: RemoteAction::Show,
        } => cmd_remote_show(&vault),
        Commands::Login { username, password } => {
            cmd_login(&mut vault, &config, &username, password).await
        }
        Commands::Add { kind } => cmd_add(&mut vault, kind),
        Commands::Rm { id } => cmd_rm(&mut vault, &id),
        Commands::Sync => cmd_sync(&mut vault, &config).await,
        Commands::Show { id, output } => cmd_show(&vault, &id, output.as_deref()),
        Commands::Ls => cmd_ls(&vault),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

fn passphrase_provider() -> Box<dyn PassphraseProvider> {
    match std::env::var(PASSPHRASE_ENV) {
        Ok(passphrase) if !passphrase.is_empty() => Box::new(StaticPassphrase::new(passphrase)),
        _ => Box::new(TerminalPrompt::new("Vault passphrase: ")),
    }
}

fn open_vault(config: &SbxConfig) -> Result<Vault> {
    let dir = expand_tilde(&config.vault.dir);
    Vault::open(&dir, passphrase_provider())
        .with_context(|| format!("opening vault at {}", dir.display()))
}

// ── `sbx remote` ──────────────────────────────────────────────────────────────

fn cmd_remote_set(vault: &mut Vault, address: &str) -> Result<()> {
    let address = address.trim();
    if address.is_empty() {
        anyhow::bail!("remote address must not be empty");
    }
    vault
        .set_remote_address(address)
        .context("saving remote address")?;
    println!("remote: {address}");
    Ok(())
}

fn cmd_remote_show(vault: &Vault) -> Result<()> {
    let remote = vault.remote();
    println!(
        "address: {}",
        remote.address.as_deref().unwrap_or("(not set)")
    );
    println!(
        "token:   {}",
        if remote.token.is_some() {
            "present"
        } else {
            "(not logged in)"
        }
    );
    Ok(())
}

// ── `sbx login` ───────────────────────────────────────────────────────────────

async fn cmd_login(
    vault: &mut Vault,
    config: &SbxConfig,
    username: &str,
    password: Option<String>,
) -> Result<()> {
    let address = vault
        .remote()
        .address
        .clone()
        .context("no remote address; run `sbx remote set <addr>` first")?;
    let password = match password {
        Some(password) => password,
        None => TerminalPrompt::new("Password: ")
            .passphrase()
            .context("reading password")?
            .expose_secret()
            .to_string(),
    };

    let client = RemoteClient::new(&address, &config.client)?;
    let token = client
        .login(username, &password)
        .await
        .with_context(|| format!("logging in to {}", client.base_url()))?;
    vault.set_remote_token(token).context("saving token")?;
    println!("logged in as {username}");
    Ok(())
}

// ── `sbx add` ─────────────────────────────────────────────────────────────────

fn cmd_add(vault: &mut Vault, kind: AddKind) -> Result<()> {
    match kind {
        AddKind::Card { number, opts } => {
            let card = BankCard::parse(&number)?;
            store(vault, opts, Secret::BankCard(card))
        }
        AddKind::Logpass {
            username,
            password,
            opts,
        } => store(
            vault,
            opts,
            Secret::LoginPassword(LoginPassword::new(username, password)),
        ),
        AddKind::File { path, mut opts } => {
            let mut file =
                File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            if opts.description.is_empty() {
                opts.description = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
            }
            store(vault, opts, Secret::Binary(&mut file))
        }
    }
}

fn store(vault: &mut Vault, opts: AddOptions, secret: Secret<'_>) -> Result<()> {
    match opts.id {
        Some(id) => {
            vault
                .update(&id, &opts.description, secret)
                .with_context(|| format!("updating {id}"))?;
            println!("{id}");
        }
        None => {
            let id = vault.add(&opts.description, secret)?;
            println!("{id}");
        }
    }
    Ok(())
}

// ── `sbx rm` / `sbx show` / `sbx ls` ──────────────────────────────────────────

fn cmd_rm(vault: &mut Vault, id: &str) -> Result<()> {
    vault.delete(id).with_context(|| format!("deleting {id}"))?;
    println!("deleted {id}");
    Ok(())
}

fn cmd_show(vault: &Vault, id: &str, output: Option<&Path>) -> Result<()> {
    let mut reader = vault.get(id).with_context(|| format!("reading {id}"))?;
    match output {
        Some(path) => {
            let mut file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            io::copy(&mut reader, &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn cmd_ls(vault: &Vault) -> Result<()> {
    let records: Vec<&SecretRecord> = vault.list().collect();
    if records.is_empty() {
        println!("vault is empty");
        return Ok(());
    }
    println!("{:<12}  {:<8}  {:<19}  DESCRIPTION", "ID", "KIND", "MODIFIED");
    for record in records {
        println!("{}", format_row(record));
    }
    Ok(())
}

fn format_row(record: &SecretRecord) -> String {
    format!(
        "{:<12}  {:<8}  {:<19}  {}",
        record.id,
        record.kind.to_string(),
        record.last_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
        record.description
    )
}

// ── `sbx sync` ────────────────────────────────────────────────────────────────

async fn cmd_sync(vault: &mut Vault, config: &SbxConfig) -> Result<()> {
    let client = RemoteClient::from_remote(vault.remote(), &config.client)?;
    let outcome = sync_vault(vault, &client)
        .await
        .with_context(|| format!("syncing with {}", client.base_url()))?;
    let message = match outcome {
        SyncOutcome::Downloaded => "downloaded remote vault",
        SyncOutcome::NothingToSync => "nothing to sync",
        SyncOutcome::Uploaded => "uploaded local vault",
        SyncOutcome::Merged => "merged with remote",
    };
    println!("{message} ({} secrets)", vault.list().count());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use clap::CommandFactory;
    use sbx_crypto::CipherMeta;
    use sbx_vault::SecretKind;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_add_card_with_overwrite() {
        let cli = Cli::try_parse_from([
            "sbx", "add", "card", "4720475535629559", "-d", "visa", "--id", "a1b2c3d4e5f6",
        ])
        .unwrap();
        match cli.command {
            Commands::Add {
                kind: AddKind::Card { number, opts },
            } => {
                assert_eq!(number, "4720475535629559");
                assert_eq!(opts.description, "visa");
                assert_eq!(opts.id.as_deref(), Some("a1b2c3d4e5f6"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn login_password_is_optional() {
        let cli = Cli::try_parse_from(["sbx", "login", "-u", "alice"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Login { ref username, password: None } if username == "alice"
        ));
    }

    #[test]
    fn ls_row_is_aligned() {
        let record = SecretRecord {
            id: "a1b2c3d4e5f6".into(),
            kind: SecretKind::BankCard,
            description: "visa".into(),
            digest: String::new(),
            meta: CipherMeta::from_bytes(vec![0; 16]),
            last_modified: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            tombstoned: false,
        };
        assert_eq!(
            format_row(&record),
            "a1b2c3d4e5f6  card      2024-03-01 12:30:00  visa"
        );
    }

    #[test]
    fn add_file_then_show_to_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut vault = Vault::open(
            tmp.path().join("vault"),
            Box::new(StaticPassphrase::new("pw")),
        )
        .unwrap();

        let src = tmp.path().join("notes.txt");
        std::fs::write(&src, b"remember the milk").unwrap();
        cmd_add(
            &mut vault,
            AddKind::File {
                path: src,
                opts: AddOptions {
                    description: String::new(),
                    id: None,
                },
            },
        )
        .unwrap();

        let record = vault.list().next().unwrap().clone();
        assert_eq!(record.description, "notes.txt");

        let out = tmp.path().join("out.txt");
        cmd_show(&vault, &record.id, Some(&out)).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"remember the milk");

        cmd_rm(&mut vault, &record.id).unwrap();
        assert_eq!(vault.list().count(), 0);
    }
}
