use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use conectada_core::bridge::{BridgeConfig, CacheStorage, ServiceWorker};
use conectada_core::command::{AppContext, Command as CoreCommand, Dispatcher};
use conectada_core::{ClientConfig, LocalStore, NewUser, SqliteStore, Transport, UreqTransport};

use crate::cli::output::{Output, TerminalNotifier};
use crate::cli::watch;

#[derive(Debug, Clone, Parser)]
#[command(name = "conectada", about = "Ciudad Conectada reports client", version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// API base url; overrides the config file
    #[arg(long)]
    pub api_base: Option<String>,
    /// SQLite file holding the session, queue and caches
    #[arg(long)]
    pub db: Option<PathBuf>,
    #[arg(long)]
    pub json: bool,
    #[arg(long)]
    pub quiet: bool,
    /// Repeat for more log output
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    Login {
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Whoami,
    Register(RegisterArgs),
    Reports,
    Report {
        id: String,
    },
    Evidence {
        id: String,
    },
    /// Change a report's status; queued for later if the server is unreachable
    SetStatus {
        id: String,
        estado: String,
    },
    /// Replay the offline queue now
    Sync,
    Queue(QueueCommand),
    /// Probe connectivity and drain whenever the server comes back
    Watch(WatchArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub last_name: String,
    #[arg(long)]
    pub email: String,
    #[arg(long)]
    pub password: String,
    #[arg(long, default_value = "ciudadano")]
    pub rol: String,
    #[arg(long)]
    pub admin: bool,
}

#[derive(Debug, Clone, Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub action: QueueAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum QueueAction {
    List,
    Drop { id: u64 },
    DeadLetters,
    ClearDeadLetters,
}

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Url to poll; defaults to the configured probe or the API base
    #[arg(long)]
    pub probe_url: Option<String>,
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

pub struct RuntimeContext {
    pub app: Arc<AppContext>,
    pub worker: Arc<ServiceWorker>,
    /// Raw network, bypassing the worker.
    pub transport: Arc<dyn Transport>,
    pub output: Output,
}

impl RuntimeContext {
    pub async fn load(cli: &Cli) -> Result<Self> {
        let config = resolve_config(cli)?;
        let store: Arc<dyn LocalStore> = Arc::new(
            SqliteStore::open(&config.storage_path)
                .with_context(|| format!("opening {}", config.storage_path.display()))?,
        );
        let transport: Arc<dyn Transport> = Arc::new(UreqTransport::new(
            config.timeouts.connect(),
            config.timeouts.read(),
            config.timeouts.write(),
        ));
        let worker = Arc::new(ServiceWorker::new(
            BridgeConfig::from_client_config(config.origin(), &config),
            transport.clone(),
            CacheStorage::new(store.clone()),
        ));
        let state = worker.start().await;
        log::debug!("worker {state}");

        let output = Output::new(cli.json, cli.quiet);
        let notifier = Arc::new(TerminalNotifier::new(cli.quiet));
        let app = AppContext::with_bridge(config, store, worker.clone(), notifier);
        Ok(Self {
            app: Arc::new(app),
            worker,
            transport,
            output,
        })
    }
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match (&cli.config, &cli.api_base) {
        (Some(path), _) => ClientConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        (None, Some(base)) => ClientConfig::new(base.clone()),
        (None, None) => return Err(anyhow!("no API base: pass --api-base or --config")),
    };
    if let Some(base) = &cli.api_base {
        config.api_base = base.clone();
    }
    if let Some(db) = &cli.db {
        config.storage_path = db.clone();
    }
    log::debug!("api base {} store {}", config.api_base, config.storage_path.display());
    Ok(config)
}

fn core_command(command: &Command) -> Option<CoreCommand> {
    let mapped = match command {
        Command::Login { email, password } => CoreCommand::Login {
            email: email.clone(),
            password: password.clone(),
        },
        Command::Logout => CoreCommand::Logout,
        Command::Whoami => CoreCommand::WhoAmI,
        Command::Register(args) => CoreCommand::Register(NewUser {
            name: args.name.clone(),
            last_name: args.last_name.clone(),
            email: args.email.clone(),
            password: args.password.clone(),
            rol: args.rol.clone(),
            is_admin: args.admin,
        }),
        Command::Reports => CoreCommand::ListReports,
        Command::Report { id } => CoreCommand::ShowReport { id: id.clone() },
        Command::Evidence { id } => CoreCommand::Evidence { id: id.clone() },
        Command::SetStatus { id, estado } => CoreCommand::SetStatus {
            id: id.clone(),
            estado: estado.clone(),
        },
        Command::Sync => CoreCommand::SyncNow,
        Command::Queue(queue) => match queue.action {
            QueueAction::List => CoreCommand::ShowQueue,
            QueueAction::Drop { id } => CoreCommand::DropQueued { id },
            QueueAction::DeadLetters => CoreCommand::DeadLetters,
            QueueAction::ClearDeadLetters => CoreCommand::ClearDeadLetters,
        },
        Command::Watch(_) => return None,
    };
    Some(mapped)
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    let ctx = RuntimeContext::load(&cli).await?;
    match core_command(&cli.command) {
        Some(command) => {
            let output = Dispatcher::new(ctx.app.clone()).dispatch(command).await?;
            ctx.output.render(&output)
        }
        None => match &cli.command {
            Command::Watch(args) => watch::run(&ctx, args).await,
            _ => Ok(()),
        },
    }
}
