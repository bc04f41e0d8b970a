// ── Keystone Gateway CLI ─────────────────────────────────────────────────────
// `clap`-derive binary: run the server, and manage accounts/settings from the
// shell. The library never calls `env_logger::init()` itself — only the
// binary does, so `gateway-core` stays usable as an embedded dependency.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use gateway_core::config::GatewayConfig;
use gateway_core::providers::{GatewayRefresher, OAuthClientCredentials};
use gateway_core::proxy::Proxy;
use gateway_core::server::{self, AppState};
use gateway_core::store::Store;
use gateway_core::token_manager::TokenManager;
use gateway_core::types::{Account, AccountStatus, Provider, TokenRecord};

#[derive(Parser)]
#[command(name = "keystone-gateway", version, about = "Local AI-provider API gateway")]
struct Cli {
    /// Path to config.toml; defaults to the OS config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server until terminated.
    Serve,
    /// Manage stored accounts.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
    /// Read or write runtime settings (e.g. auto_switch_enabled).
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Print a shell completion script to stdout.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum AccountsCommand {
    /// List all stored accounts.
    List,
    /// Register a new account.
    Add {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        access_token: String,
        /// OAuth refresh token for cloud providers, or the base URL for local ones.
        #[arg(long)]
        refresh_token: String,
        /// Set as the active account immediately.
        #[arg(long)]
        activate: bool,
    },
    /// Remove an account by id.
    Remove {
        id: String,
    },
    /// Make an account the active one.
    Activate {
        id: String,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Get { key: String },
    Set { key: String, value: String },
}

fn store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("keystone-gateway")
        .join("accounts.sqlite3")
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Command::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "keystone-gateway", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = match cli.config {
        Some(p) => p,
        None => GatewayConfig::default_path()?,
    };
    let config = GatewayConfig::load(&config_path)?;

    let path = store_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&path)?);

    match cli.command {
        Command::Serve => run_server(config, store).await?,
        Command::Accounts { command } => run_accounts(&store, command)?,
        Command::Settings { command } => run_settings(&store, command)?,
        Command::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

async fn run_server(config: GatewayConfig, store: Arc<Store>) -> anyhow::Result<()> {
    let token_manager = Arc::new(TokenManager::new(store.clone()));
    token_manager.load()?;

    let refresher = Arc::new(GatewayRefresher {
        client: gateway_core::http::default_client(),
        google_oauth: OAuthClientCredentials {
            client_id: std::env::var("KEYSTONE_GOOGLE_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("KEYSTONE_GOOGLE_CLIENT_SECRET").unwrap_or_default(),
        },
    });
    let google_api_key = std::env::var("KEYSTONE_GOOGLE_API_KEY").ok();

    let proxy = Arc::new(Proxy::new(
        store.clone(),
        token_manager.clone(),
        gateway_core::http::default_client(),
        refresher,
        google_api_key,
    ));

    let state = AppState::new(config, store, token_manager, proxy);
    server::serve(state).await?;
    Ok(())
}

fn run_accounts(store: &Store, command: AccountsCommand) -> anyhow::Result<()> {
    match command {
        AccountsCommand::List => {
            for account in store.list()? {
                let last_used = if account.last_used == 0 {
                    "never".to_string()
                } else {
                    chrono::DateTime::from_timestamp(account.last_used, 0)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "invalid".into())
                };
                println!(
                    "{}  {:<16} {:<30} active={} status={:?} last_used={}",
                    account.id, account.provider.as_str(), account.email, account.is_active, account.status, last_used
                );
            }
        }
        AccountsCommand::Add { provider, email, access_token, refresh_token, activate } => {
            let provider = Provider::from_str(&provider)
                .ok_or_else(|| anyhow::anyhow!("unknown provider '{provider}'"))?;
            let account = Account {
                id: uuid::Uuid::new_v4().to_string(),
                provider,
                email,
                name: None,
                avatar_url: None,
                token: TokenRecord {
                    access_token,
                    refresh_token,
                    expires_in: 3600,
                    expiry_timestamp: now() + 3600,
                    token_type: "Bearer".into(),
                    project_id: None,
                    session_id: None,
                    extra: Default::default(),
                },
                quota: None,
                created_at: now(),
                last_used: 0,
                status: AccountStatus::Active,
                is_active: activate,
                selected_models: vec![],
            };
            store.add(&account)?;
            println!("added account {}", account.id);
        }
        AccountsCommand::Remove { id } => {
            store.remove(&id)?;
            println!("removed {id}");
        }
        AccountsCommand::Activate { id } => {
            store.set_active(&id)?;
            println!("activated {id}");
        }
    }
    Ok(())
}

fn run_settings(store: &Store, command: SettingsCommand) -> anyhow::Result<()> {
    match command {
        SettingsCommand::Get { key } => {
            println!("{}", store.get_setting(&key, "")?);
        }
        SettingsCommand::Set { key, value } => {
            store.set_setting(&key, &value)?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}
