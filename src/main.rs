use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_bot_lib::backend::OllamaClient;
use relay_bot_lib::cancellation::CancellationController;
use relay_bot_lib::channel::ChatChannel;
use relay_bot_lib::commands::CommandDispatcher;
use relay_bot_lib::config::RelayConfig;
use relay_bot_lib::execution::{ExecutionContext, ExecutionSettings};
use relay_bot_lib::i18n::Localizer;
use relay_bot_lib::renderer::{OutboundRenderer, RendererConfig};
use relay_bot_lib::scheduler::Scheduler;
use relay_bot_lib::telegram::{run_polling, TelegramChannel, UpdateHandler};
use relay_bot_lib::usage::{InMemoryUserStore, SqliteUserStore, UserStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_bot_lib::init_tracing();
    let cfg = RelayConfig::from_env_and_file().context("failed to load configuration")?;
    let token = cfg
        .telegram_token
        .clone()
        .context("telegram token missing (set TELEGRAM_BOT_TOKEN or RELAY__TELEGRAM_TOKEN)")?;

    let store: Arc<dyn UserStore> = match &cfg.database_path {
        Some(path) => {
            info!("[Main] using sqlite store at {}", path.display());
            Arc::new(SqliteUserStore::open(path)?)
        }
        None => {
            warn!("[Main] database_path not set, preferences and usage are kept in memory");
            Arc::new(InMemoryUserStore::new())
        }
    };

    let backend = Arc::new(OllamaClient::new(
        &cfg.backend_url,
        cfg.request_timeout(),
        Duration::from_secs(cfg.model_size_cache_ttl_secs),
    )?);
    let telegram = Arc::new(TelegramChannel::new(&cfg.telegram_api_base, &token)?);
    let channel: Arc<dyn ChatChannel> = telegram.clone();
    let renderer = OutboundRenderer::new(
        Arc::clone(&channel),
        RendererConfig {
            min_interval: cfg.render_min_interval(),
            safe_length: cfg.render_safe_length,
        },
    );
    let localizer = Arc::new(Localizer::new(cfg.default_locale.clone()));
    let scheduler = Scheduler::new(cfg.max_user_queue_size);

    let ctx = Arc::new(ExecutionContext {
        backend: Arc::clone(&backend),
        renderer,
        store,
        localizer: Arc::clone(&localizer),
        settings: ExecutionSettings::from(&cfg),
    });
    let cancellation = Arc::new(CancellationController::new(
        Arc::clone(&scheduler),
        backend,
        channel,
        localizer,
        cfg.operator_ids.iter().copied(),
    ));
    let dispatcher: Arc<dyn UpdateHandler> = Arc::new(CommandDispatcher::new(
        scheduler,
        ctx,
        cancellation,
        cfg.intents.clone(),
    ));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[Main] shutdown requested");
        }
        signal.cancel();
    });

    info!(
        "[Main] relaying to {} (default model {})",
        cfg.backend_url, cfg.default_model
    );
    run_polling(telegram, dispatcher, shutdown).await;
    Ok(())
}
