//! vpn-cluster-bot — Telegram-бот продажи VPN поверх кластеров панелей 3x-ui.

mod balancer;
mod bot;
mod config;
mod db;
mod export;
mod keys;
mod panel;
mod probe;
mod sync;

use panel::{PanelConnector, XuiConnector};
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/vpn-cluster-bot.toml"));
    tracing::info!(
        "Starting vpn-cluster-bot with config {}",
        config_path.display()
    );

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        trial_days = config.trial_days,
        sync_concurrency = config.sync.concurrency,
        sync_pacing_ms = config.sync.pacing_ms,
        fallback_cluster = %config.clusters.fallback_cluster,
        channel_required = config.channel.required_channel().is_some(),
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);
    let connector: Arc<dyn PanelConnector> = Arc::new(XuiConnector::new(config.panel.clone()));

    let bot = Bot::new(token);
    let bot_username = match bot.get_me().await {
        Ok(me) => me.user.username.clone(),
        Err(error) => {
            tracing::warn!(
                error = %error,
                "Не удалось получить username бота через getMe"
            );
            None
        }
    };

    let state = bot::handlers::BotState::new(config, db, connector, bot_username);
    tracing::info!("Dispatcher initialized, bot is ready");

    Dispatcher::builder(bot, bot::handlers::schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
