//! eportal watchdog: keep a campus captive-portal session signed in.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use eportal_watchdog::config::Config;
use eportal_watchdog::reconciler::{Event, Options, Reconciler};
use eportal_watchdog::{
    Credential, CredentialStore, PingProbe, PortalClient, SystemInterfaceProbe,
};

type Watchdog = Reconciler<SystemInterfaceProbe, PingProbe, PortalClient>;

#[derive(Parser, Debug)]
#[command(
    name = "eportal-watchdog",
    version,
    about = "Keep a campus eportal session signed in",
    long_about = "Watches local interfaces and campus reachability. When the captive portal drops the session, signs back in with the saved auto-login account (bounded retries with a cool-down)."
)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, short = 'c', env = "EPORTAL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Saved accounts file (default: ~/net_ids.json)
    #[arg(long, env = "EPORTAL_CREDENTIALS", global = true)]
    pub credentials: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the network and sign in automatically (default)
    Run {
        /// One reachability check and one refresh, then exit
        #[arg(long, short = '1', alias = "single")]
        once: bool,

        /// Never sign in automatically
        #[arg(long)]
        no_auto_login: bool,
    },
    /// Print the current network state as JSON
    Status,
    /// Sign in (default: the auto-login account)
    Login { account: Option<String> },
    /// Sign this address out
    Logout { account: Option<String> },
    /// Show the devices bound to an account
    Bindings { account: Option<String> },
    /// Manage saved accounts
    #[command(subcommand)]
    Accounts(AccountsCommand),
}

#[derive(Subcommand, Debug)]
enum AccountsCommand {
    /// List saved accounts
    List,
    /// Add or replace an account; the password is prompted for
    Add {
        account: String,
        /// Use this account for automatic sign-in
        #[arg(long)]
        auto: bool,
    },
    /// Remove an account
    Remove { account: String },
    /// Mark an account for automatic sign-in
    Auto {
        account: String,
        /// Clear the flag instead
        #[arg(long)]
        off: bool,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(path) = &cli.credentials {
        config.credentials_path = Some(path.clone());
    }
    Ok(config)
}

fn build(config: &Config, options: Options) -> anyhow::Result<Arc<Watchdog>> {
    let store = CredentialStore::load(config.credentials_path())?;
    let portal = PortalClient::new(&config.portal)?;
    Ok(Arc::new(Reconciler::new(
        SystemInterfaceProbe::new(&config.interfaces),
        PingProbe::new(&config.reachability),
        portal,
        store,
        options,
    )))
}

fn log_events(watchdog: &Watchdog) {
    let mut events = watchdog.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::StateChanged(state)) => {
                    tracing::debug!("State: {:?}", state);
                }
                Ok(Event::ConnectivityChanged {
                    online,
                    connectivity,
                }) => {
                    if online {
                        tracing::info!("Network OK");
                    } else {
                        tracing::warn!("Network unreachable ({:?})", connectivity);
                    }
                }
                Ok(Event::LoginFinished {
                    account_id,
                    automatic,
                    success,
                    message,
                }) => {
                    let how = if automatic { "automatic" } else { "manual" };
                    if success {
                        tracing::info!("{} sign in as {}: {}", how, account_id, message);
                    } else {
                        tracing::warn!("{} sign in as {} failed: {}", how, account_id, message);
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::debug!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run(config: &Config, once: bool, no_auto_login: bool) -> anyhow::Result<()> {
    let mut options = Options::from_config(config);
    options.auto_login &= !no_auto_login;
    let watchdog = build(config, options)?;
    log_events(&watchdog);

    tracing::info!(
        "eportal watchdog started, mode: {}",
        if once { "single run" } else { "loop" }
    );
    if once {
        let (outcome, state) = watchdog.run_once().await;
        if let Some(outcome) = outcome {
            tracing::info!("Reachability: {:?}", outcome.result);
        }
        if let Some(state) = state {
            tracing::info!("Network {:?} ipv4={:?}", state.online_status, state.ipv4);
        }
        tracing::info!("--once mode, exiting");
        return Ok(());
    }
    watchdog.run(shutdown_signal()).await;
    Ok(())
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let mut options = Options::from_config(config);
    options.auto_login = false;
    let watchdog = build(config, options)?;
    let (outcome, state) = watchdog.run_once().await;
    let report = serde_json::json!({
        "reachability": outcome.map(|o| o.result),
        "connectivity": outcome.map(|o| o.connectivity),
        "state": state,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn prompt_password(account: &str) -> anyhow::Result<String> {
    let password = rpassword::prompt_password(format!("Password for {}: ", account))
        .context("reading password")?;
    if password.is_empty() {
        bail!("password cannot be empty");
    }
    Ok(password)
}

fn accounts(config: &Config, command: AccountsCommand) -> anyhow::Result<()> {
    let mut store = CredentialStore::load(config.credentials_path())?;
    match command {
        AccountsCommand::List => {
            if store.is_empty() {
                println!("No saved accounts in {}", store.path().display());
            }
            for cred in store.list() {
                let marker = if cred.auto_login { " (auto)" } else { "" };
                println!("{}{}", cred.account_id, marker);
            }
        }
        AccountsCommand::Add { account, auto } => {
            if account.trim().is_empty() {
                bail!("account id cannot be empty");
            }
            let password = prompt_password(&account)?;
            store.upsert(Credential::new(account, password, auto))?;
        }
        AccountsCommand::Remove { account } => {
            if !store.remove(&account)? {
                bail!("no saved account '{}'", account);
            }
        }
        AccountsCommand::Auto { account, off } => store.set_auto_login(&account, !off)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let config = load_config(&cli)?;
    match cli.command {
        None => run(&config, false, false).await,
        Some(Command::Run {
            once,
            no_auto_login,
        }) => run(&config, once, no_auto_login).await,
        Some(Command::Status) => status(&config).await,
        Some(Command::Login { account }) => {
            let mut options = Options::from_config(&config);
            options.auto_login = false;
            let watchdog = build(&config, options)?;
            let reply = watchdog.sign_in(account.as_deref()).await?;
            println!("{}", reply.message.unwrap_or_else(|| "signed in".into()));
            Ok(())
        }
        Some(Command::Logout { account }) => {
            let mut options = Options::from_config(&config);
            options.auto_login = false;
            let watchdog = build(&config, options)?;
            let reply = watchdog.sign_out(account.as_deref()).await?;
            println!("{}", reply.message.unwrap_or_else(|| "signed out".into()));
            Ok(())
        }
        Some(Command::Bindings { account }) => {
            let account = match account {
                Some(id) => id,
                None => CredentialStore::load(config.credentials_path())?
                    .auto_login()
                    .map(|c| c.account_id)
                    .context("no account given and no auto-login account saved")?,
            };
            let portal = PortalClient::new(&config.portal)?;
            let bindings = portal.fetch_mac_bindings(&account).await?;
            println!("{}", serde_json::to_string_pretty(&bindings)?);
            Ok(())
        }
        Some(Command::Accounts(command)) => accounts(&config, command),
    }
}
