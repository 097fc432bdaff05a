mod ai;
mod config;
mod delivery;
mod geo;
mod matcher;
mod monitor;
mod notify;
mod parser;
mod store;
mod telegram;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use reqwest::Client as HttpClient;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Cfg;
use crate::delivery::{BotApi, SessionReplier};
use crate::geo::GeoResolver;
use crate::monitor::{FleetMonitor, OrderSink};
use crate::notify::NotificationCoordinator;
use crate::parser::OrderExtractor;
use crate::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    let cfg = Cfg::from_env()?;

    let store = Arc::new(Store::open(&cfg.db_path)?);
    bootstrap_session_if_needed(&cfg, &store).await?;

    let geo = Arc::new(GeoResolver::new(&cfg.geocoder_user_agent));
    let ai = ai::AiExtractor::from_env();
    info!("AI fallback: {ai}");
    let extractor = Arc::new(OrderExtractor::new(geo, Some(ai)));

    let bot = BotApi::new(HttpClient::new(), &cfg.bot_token);
    let coordinator = Arc::new(NotificationCoordinator::new(
        Arc::clone(&store),
        bot.clone(),
        cfg.quiet_tz_offset_minutes,
        cfg.filter_by_source_group,
    ));

    // Take-order callbacks come in over the Bot API in the background.
    let replier = Arc::new(SessionReplier::new(cfg.api_id, Arc::clone(&store)));
    {
        let bot = bot.clone();
        let coordinator = Arc::clone(&coordinator);
        let replier = Arc::clone(&replier);
        tokio::spawn(async move {
            delivery::run_callback_polling(bot, coordinator, replier).await;
        });
    }

    let sink: Arc<dyn OrderSink> = coordinator;
    let mut fleet = FleetMonitor::new(cfg.api_id, Arc::clone(&store), extractor, sink);

    info!("Ride scout started");
    tokio::select! {
        res = fleet.run() => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            fleet.stop();
        }
    }
    Ok(())
}

/// First-run convenience: with no authorized session on file and `TG_PHONE`
/// set, log that account in interactively and register its session.
async fn bootstrap_session_if_needed(cfg: &Cfg, store: &Arc<Store>) -> Result<()> {
    if !store.authorized_sessions()?.is_empty() {
        return Ok(());
    }
    let Ok(phone) = std::env::var("TG_PHONE") else {
        warn!("No authorized account sessions and TG_PHONE is unset; monitors stay idle");
        return Ok(());
    };

    std::fs::create_dir_all(&cfg.sessions_dir)
        .with_context(|| format!("Creating sessions dir {}", cfg.sessions_dir))?;
    let session_file = format!(
        "{}/{}.session.sqlite",
        cfg.sessions_dir,
        phone.trim_start_matches('+')
    );

    let (client, pool) = telegram::connect(&session_file, cfg.api_id)?;
    let runner = pool.runner;
    let _runner = telegram::RunnerGuard::new(tokio::spawn(async move {
        runner.run().await;
    }));
    telegram::ensure_user_login(&client, &phone, &cfg.api_hash).await?;

    // Optional owner link so the account can post take-order replies for
    // that driver.
    let owner: Option<i64> = std::env::var("TG_DRIVER_ID")
        .ok()
        .and_then(|v| v.trim().parse().ok());
    store.add_session(&phone, &session_file, owner)?;
    info!("Account {phone} registered with session {session_file}");
    Ok(())
}
