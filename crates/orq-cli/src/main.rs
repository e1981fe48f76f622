use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "orq")]
#[command(about = "orq admin CLI", long_about = None)]
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

    /// Validate a chain definition file without storing it
    ChainCheck {
        /// Path to a JSON chain definition
        path: String,
    },

    /// Print the redacted config hash for this environment
    ConfigHash,

    /// Force both reconciliation cycles on a running daemon
    TriggerCycles {
        /// Daemon base URL
        #[arg(long, default_value = "http://127.0.0.1:8081")]
        daemon: String,
        /// Admin token, when the daemon has one configured
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = orq_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = orq_db::status(&pool).await?;
                    println!("db_ok={} has_schema={}", s.ok, s.has_schema);
                }
                DbCmd::Migrate => {
                    orq_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ChainCheck { path } => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
            let def: orq_schemas::ChainDefinition =
                serde_json::from_str(&raw).with_context(|| format!("parse {path}"))?;
            orq_tasks::validate_chain(&def)?;
            println!("chain_ok={} tasks={}", def.id, def.tasks.len());
        }

        Commands::ConfigHash => {
            let config = orq_config::Config::from_env()?;
            println!("config_hash={}", config.config_hash()?);
        }

        Commands::TriggerCycles { daemon, token } => {
            let url = format!("{}/v1/cycles/trigger", daemon.trim_end_matches('/'));
            let mut req = reqwest::Client::new().post(&url);
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            let resp = req.send().await.with_context(|| format!("dial {url}"))?;
            if !resp.status().is_success() {
                anyhow::bail!("{url} returned {}", resp.status());
            }
            println!("triggered=true");
        }
    }

    Ok(())
}
