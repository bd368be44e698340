use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kedai::bot::Bot;
use kedai::config::Config;
use kedai::conversation::ConversationRegistry;
use kedai::ledger::Ledger;
use kedai::payment::backends::{DonationBackend, GatewayBackend, PaymentBackend};
use kedai::payment::webhook::{self, WebhookState};
use kedai::payment::{PaymentOrchestrator, PollTimings};
use kedai::provisioning::api::RemotePanelClient;
use kedai::provisioning::ProvisioningCoordinator;
use kedai::store::Store;
use kedai::sweeper::ExpirySweeper;
use kedai::transport::polling::PollingService;
use kedai::transport::{ChatTransport, TelegramTransport};

#[derive(Parser)]
#[command(name = "kedai", version, about = "Chat-driven storefront bot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with all background services.
    Run {
        #[arg(short, long, env = "KEDAI_CONFIG", default_value = "kedai.toml")]
        config: PathBuf,
    },
    /// Write a default config file and exit.
    InitConfig {
        #[arg(short, long, default_value = "kedai.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::InitConfig { path } => {
            Config::init_at(&path)?;
            println!("wrote default config to {}", path.display());
            Ok(())
        }
        Commands::Run { config } => run(Config::load(&config)?).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!(store = %config.bot.store_name, "starting up");

    let store = Store::open(&config.db_path)?;
    let ledger = Ledger::new(store.clone());

    let mut backends: Vec<Arc<dyn PaymentBackend>> = Vec::new();
    if config.gateway.enabled {
        backends.push(Arc::new(GatewayBackend::new(&config.gateway)));
    }
    if config.donation.enabled {
        backends.push(Arc::new(DonationBackend::new(&config.donation)));
    }
    info!(backends = backends.len(), "payment backends enabled");

    let payments = Arc::new(PaymentOrchestrator::new(
        store.clone(),
        ledger.clone(),
        backends,
        config.topup.clone(),
        PollTimings {
            tick: Duration::from_secs(config.gateway.poll_interval_secs),
            deadline: Duration::from_secs(config.gateway.invoice_deadline_secs),
        },
    ));

    let provisioning = ProvisioningCoordinator::new(
        store.clone(),
        ledger.clone(),
        Arc::new(RemotePanelClient::new()),
        config.trial.clone(),
    );

    let telegram = TelegramTransport::new(config.bot.token.clone());
    let transport: Arc<dyn ChatTransport> = Arc::new(telegram.clone());

    if config.webhook.enabled {
        let state = WebhookState {
            payments: Arc::clone(&payments),
            transport: Arc::clone(&transport),
        };
        let bind = config.webhook.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(&bind, state).await {
                tracing::error!("webhook server exited: {e:#}");
            }
        });
    }

    let sweeper = ExpirySweeper::new(
        store.clone(),
        provisioning.clone(),
        Arc::clone(&transport),
        config.sweeper.clone(),
    );
    tokio::spawn(sweeper.run());

    let conversations = ConversationRegistry::new(store.clone(), config.topup.clone());
    let bot = Arc::new(Bot::new(
        store,
        ledger,
        conversations,
        payments,
        provisioning,
        Arc::clone(&transport),
        config.bot.clone(),
        config.trial.enabled,
    ));

    let (tx, rx) = mpsc::channel(256);
    let polling = PollingService::new(telegram, tx, config.bot.poll_timeout_secs);
    tokio::spawn(async move { polling.run().await });

    bot.run(rx).await;
    Ok(())
}
