//! Operator CLI for the publishing service.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use uuid::Uuid;

use txp_pool::{NewOutput, OutputCategory, PoolManager};

#[derive(Parser)]
#[command(name = "txp")]
#[command(about = "txpress publishing service CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Output pool commands
    Pool {
        #[command(subcommand)]
        cmd: PoolCmd,
    },

    /// Client administration
    Client {
        #[command(subcommand)]
        cmd: ClientCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum PoolCmd {
    /// Print (category, status) counts.
    Stats,

    /// Register outputs from a JSON file (idempotent; safe to replay).
    Import {
        /// Path to a JSON array of outputs:
        /// [{"txid": "...", "vout": 0, "value_satoshis": 550,
        ///   "locking_script_hex": "...", "category": "publishing"}, ...]
        #[arg(long)]
        file: String,
    },
}

#[derive(Subcommand)]
enum ClientCmd {
    /// Create a client and print its API key (shown exactly once).
    Create {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "standard")]
        tier: String,

        #[arg(long, default_value_t = 10_000)]
        daily_limit: i64,

        /// Require detached signatures on every request.
        #[arg(long, default_value_t = false)]
        require_signature: bool,

        /// Compressed secp256k1 public key, hex.
        #[arg(long)]
        pubkey: Option<String>,

        /// Allowed Origin header values (repeatable). Empty = any.
        #[arg(long = "origin")]
        origins: Vec<String>,
    },

    /// Rotate a client's signing key; the prior key stays valid for the
    /// configured grace window.
    RotateKey {
        #[arg(long)]
        name: String,

        #[arg(long)]
        pubkey: String,
    },

    /// Change a client's daily admission limit.
    SetLimit {
        #[arg(long)]
        name: String,

        #[arg(long)]
        limit: i64,
    },
}

#[derive(Debug, Deserialize)]
struct ImportedOutput {
    txid: String,
    vout: i32,
    value_satoshis: i64,
    locking_script_hex: String,
    category: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => {
                let pool = txp_store::connect_from_env().await?;
                let st = txp_store::status(&pool).await?;
                println!("connectivity: {}", if st.ok { "ok" } else { "FAILED" });
                println!(
                    "schema: {}",
                    if st.has_outputs_table {
                        "present"
                    } else {
                        "missing (run `txp db migrate`)"
                    }
                );
            }
            DbCmd::Migrate => {
                let pool = txp_store::connect_from_env().await?;
                txp_store::migrate(&pool).await?;
                println!("migrations applied");
            }
        },

        Commands::Pool { cmd } => match cmd {
            PoolCmd::Stats => {
                let db = txp_store::connect_from_env().await?;
                let manager = PoolManager::new(db);
                let stats = manager.stats().await?;
                if stats.is_empty() {
                    println!("pool is empty");
                }
                for (category, status, count) in stats {
                    println!("{category:<12} {status:<10} {count}");
                }
            }
            PoolCmd::Import { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("read import file: {file}"))?;
                let outputs: Vec<ImportedOutput> =
                    serde_json::from_str(&raw).context("import file is not a JSON output list")?;

                let db = txp_store::connect_from_env().await?;
                let manager = PoolManager::new(db);

                let mut inserted = 0usize;
                let mut skipped = 0usize;
                for entry in outputs {
                    let output = NewOutput {
                        txid: entry.txid,
                        vout: entry.vout,
                        value_satoshis: entry.value_satoshis,
                        locking_script: hex::decode(&entry.locking_script_hex)
                            .context("locking_script_hex is not hex")?,
                        category: OutputCategory::parse(&entry.category)?,
                    };
                    if manager.register(&output).await? {
                        inserted += 1;
                    } else {
                        skipped += 1;
                    }
                }
                println!("imported {inserted} outputs ({skipped} already registered)");
            }
        },

        Commands::Client { cmd } => match cmd {
            ClientCmd::Create {
                name,
                tier,
                daily_limit,
                require_signature,
                pubkey,
                origins,
            } => {
                if require_signature && pubkey.is_none() {
                    bail!("--require-signature needs --pubkey");
                }

                let db = txp_store::connect_from_env().await?;
                let api_key = format!(
                    "txp_{}{}",
                    Uuid::new_v4().simple(),
                    Uuid::new_v4().simple()
                );
                let client = txp_store::NewClient {
                    client_id: Uuid::new_v4(),
                    name: name.clone(),
                    api_key_hash: txp_auth::hash_api_key(&api_key),
                    pubkey_hex: pubkey,
                    tier,
                    require_signature,
                    allowed_origins: origins,
                    daily_limit,
                };
                txp_store::insert_client(&db, &client).await?;

                println!("client created: {name} ({})", client.client_id);
                println!("API key (store it now; only its hash is kept):");
                println!("{api_key}");
            }
            ClientCmd::RotateKey { name, pubkey } => {
                let db = txp_store::connect_from_env().await?;
                if txp_store::rotate_client_key(&db, &name, &pubkey).await? {
                    println!("key rotated for {name}; prior key valid through the grace window");
                } else {
                    bail!("unknown client: {name}");
                }
            }
            ClientCmd::SetLimit { name, limit } => {
                let db = txp_store::connect_from_env().await?;
                if txp_store::set_daily_limit(&db, &name, limit).await? {
                    println!("daily limit for {name} set to {limit}");
                } else {
                    bail!("unknown client: {name}");
                }
            }
        },
    }

    Ok(())
}
