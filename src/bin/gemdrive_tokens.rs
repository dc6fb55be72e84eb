//! CLI entry point for gemdrive-tokens: offline token administration.
//!
//! Operates on the same `tokens.jsonl` the server reads.  A running server
//! picks up changes on its next start.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use gemdrive::auth::{random_hex, Key, Permission, Privilege};
use gemdrive::tokens::TokenStore;

#[derive(Parser)]
#[command(name = "gemdrive-tokens", about = "gemdrive access token administration")]
struct Cli {
    /// Configuration file to take `data_dir` from.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Token store directory; overrides the configuration file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum PermArg {
    Read,
    Write,
}

impl From<PermArg> for Permission {
    fn from(p: PermArg) -> Self {
        match p {
            PermArg::Read => Permission::Read,
            PermArg::Write => Permission::Write,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a token directly, without the authorization handshake
    Mint {
        /// Path prefix the token covers. Repeatable.
        #[arg(long = "path", required = true)]
        paths: Vec<String>,
        #[arg(long, value_enum, default_value = "read")]
        perm: PermArg,
        #[arg(long)]
        label: Option<String>,
        #[arg(long, default_value_t = 365)]
        ttl_days: u64,
    },
    /// List live tokens
    List,
    /// Revoke the token whose hash starts with PREFIX
    Revoke { prefix: String },
}

fn main() {
    let cli = Cli::parse();
    let data_dir = match resolve_data_dir(cli.config.as_ref(), cli.data_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error reading config: {:#}", e);
            std::process::exit(1);
        }
    };
    let store = match TokenStore::open(&data_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening token store in {}: {:#}", data_dir.display(), e);
            std::process::exit(1);
        }
    };

    let rc = match cli.command {
        Commands::Mint {
            paths,
            perm,
            label,
            ttl_days,
        } => run_mint(&store, paths, perm.into(), label, ttl_days),
        Commands::List => run_list(&store),
        Commands::Revoke { prefix } => run_revoke(&store, &prefix),
    };
    std::process::exit(rc);
}

fn resolve_data_dir(config: Option<&PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = data_dir {
        return Ok(dir);
    }
    match config {
        Some(path) => Ok(gemdrive::config::load_config(path)?.data_dir),
        None => Ok(gemdrive::config::Config::default().data_dir),
    }
}

fn run_mint(
    store: &TokenStore,
    paths: Vec<String>,
    perm: Permission,
    label: Option<String>,
    ttl_days: u64,
) -> i32 {
    let key = Key {
        id: label.clone(),
        privileges: paths
            .into_iter()
            .map(|path| Privilege { path, perm })
            .collect(),
    };
    if let Err(e) = key.validate() {
        eprintln!("Error: {}", e);
        return 1;
    }

    let token = random_hex(32);
    let ttl = Duration::from_secs(ttl_days.saturating_mul(86400));
    match store.insert(&token, label, key.privileges, ttl) {
        Ok(record) => {
            eprintln!(
                "Minted {} (expires {})",
                short_hash(&record.hash),
                format_time(record.expires_at)
            );
            println!("{}", token);
            0
        }
        Err(e) => {
            eprintln!("Error minting token: {:#}", e);
            1
        }
    }
}

fn run_list(store: &TokenStore) -> i32 {
    let records = match store.list() {
        Ok(records) => records,
        Err(e) => {
            eprintln!("Error listing tokens: {:#}", e);
            return 1;
        }
    };
    for record in records {
        let scopes: Vec<String> = record
            .privileges
            .iter()
            .map(|p| {
                let perm = match p.perm {
                    Permission::Read => "read",
                    Permission::Write => "write",
                };
                format!("{}:{}", p.path, perm)
            })
            .collect();
        println!(
            "{}  {}  expires {}  {}",
            short_hash(&record.hash),
            record.label.as_deref().unwrap_or("-"),
            format_time(record.expires_at),
            scopes.join(",")
        );
    }
    0
}

fn run_revoke(store: &TokenStore, prefix: &str) -> i32 {
    match store.revoke(prefix) {
        Ok(hash) => {
            eprintln!("Revoked {}", hash);
            0
        }
        Err(e) => {
            eprintln!("Error revoking token: {:#}", e);
            1
        }
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn format_time(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}
