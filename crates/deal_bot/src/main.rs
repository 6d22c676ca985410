//! Command line entry point for the deal bot.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deal_bot::*;
use job_scheduler::Scheduler;
use marketplace_api::{ItemId, RequestPipeline, ReservationService, TokenRefresher};
use notification_services::{LogNotifier, Notifier, NtfyClient};

#[derive(Debug, Parser)]
#[command(name = "deal-bot", version, about = "Reserves favorited surplus food the moment it appears")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch favorites until interrupted.
    Run,
    /// Scan favorites once.
    Check,
    /// Reserve an item and keep the reservation alive until interrupted.
    Hold {
        /// Listing id.
        item_id: ItemId,
    },
    /// Reserve and pay for an item.
    Order {
        /// Listing id.
        item_id: ItemId,
    },
    /// Poll an item for a restock right now.
    Snipe {
        /// Listing id.
        item_id: ItemId,
    },
    /// Add an item to the account's favorites so `run` watches it.
    Favorite {
        /// Listing id.
        item_id: ItemId,
    },
}

struct App {
    bot: Arc<Bot>,
    pipeline: Arc<RequestPipeline>,
    config: BotConfig,
}

fn build(config: BotConfig) -> anyhow::Result<App> {
    let lists = Arc::new(ItemLists::load(&config.items_path)?);
    let credentials = load_credentials(&config.credentials_path)?;

    let notifier: Arc<dyn Notifier> = match &config.ntfy_topic {
        Some(topic) => {
            log::info!("📣 Publishing notifications to topic {}", topic);
            Arc::new(NtfyClient::new(&config.ntfy_base_url, topic)?)
        }
        None => {
            log::info!("🔧 NTFY_TOPIC not set, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let scheduler = Scheduler::new();
    let refresher = TokenRefresher::new(
        RequestPipeline::build_client(&config.pipeline)?,
        &config.pipeline.base_url,
        credentials,
    );
    let pipeline = Arc::new(
        RequestPipeline::new(config.pipeline.clone(), Arc::new(refresher))?
            .with_captcha_listener(Arc::new(CaptchaHalt::new(scheduler.clone(), notifier.clone()))),
    );
    let service = Arc::new(ReservationService::new(
        pipeline.clone(),
        notifier.clone(),
        config.area,
    ));

    let bot = Bot::new(
        service,
        scheduler,
        notifier,
        lists,
        config.timings.clone(),
        config.rounding,
    );
    Ok(App {
        bot,
        pipeline,
        config,
    })
}

async fn execute(bot: &Arc<Bot>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run => bot.run().await?,
        Command::Check => bot.check_favorites().await,
        Command::Hold { item_id } => {
            let item = bot.service().get_item(item_id).await?;
            if bot.hold(&item, item.max_quantity()).await.is_some() {
                log::info!("⏳ Holding item {} until interrupted", item_id);
                bot.wait_for_shutdown().await;
            }
        }
        Command::Order { item_id } => {
            let item = bot.service().get_item(item_id).await?;
            bot.order(&item, item.max_quantity()).await;
        }
        Command::Snipe { item_id } => {
            if bot.snipe(item_id).await?.is_some() {
                log::info!("⏳ Holding item {} until interrupted", item_id);
                bot.wait_for_shutdown().await;
            }
        }
        Command::Favorite { item_id } => {
            bot.service().favorite(item_id).await?;
            log::info!("⭐ Item {} added to favorites", item_id);
        }
    }
    Ok(())
}

async fn start(cli: Cli) -> anyhow::Result<()> {
    let config = BotConfig::from_env().context("Failed to read configuration")?;
    let app = build(config).context("Failed to start bot")?;

    let outcome = execute(&app.bot, cli.command).await;
    app.bot.scheduler().stop();

    // Tokens may have been refreshed during the run
    let credentials = app.pipeline.credentials().current();
    save_credentials(&app.config.credentials_path, &credentials)
        .context("Failed to save credentials")?;
    outcome
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    log::info!("🚀 Starting deal bot...");

    if let Err(e) = start(cli).await {
        log::error!("❌ {:#}", e);
        std::process::exit(1);
    }
    log::info!("👋 Deal bot stopped");
}
