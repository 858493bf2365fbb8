//! One-shot trade command handlers: open, close, settings and list.

use tracing::info;

use super::Engine;
use crate::cli::{OpenCliConfig, SettingsCliConfig};
use crate::collaborators::Persistence;
use crate::config::EngineConfig;
use crate::trade::{PairTrade, TradeId};

fn print_trade(trade: &PairTrade) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(trade)?);
    Ok(())
}

/// Open a pair trade and print the resulting record.
///
/// # Errors
/// Returns the open failure (validation, margin, leg or compensation error).
pub async fn run_open(
    config: EngineConfig,
    args: OpenCliConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = args.into_request(&config.trading)?;
    let user_id = request.user_id.clone();
    let engine = Engine::build(config, false, Some(&user_id)).await?;
    engine.store.ensure_account(&user_id).await?;

    let session = engine.registry.session(&user_id).await?;
    let result = engine.manager.open_trade(&session, request).await;
    engine.registry.release_all().await;

    let trade = result?;
    info!(trade_id = %trade.id, "Trade opened");
    print_trade(&trade)
}

/// Close an active trade at market (reason `manual`).
pub async fn run_close(
    config: EngineConfig,
    user_id: &str,
    trade_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::build(config, false, Some(user_id)).await?;
    let session = engine.registry.session(user_id).await?;
    let result = engine
        .manager
        .close_by_id(&session, user_id, &TradeId::from(trade_id))
        .await;
    engine.registry.release_all().await;

    print_trade(&result?)
}

/// Change the exit settings of an active trade.
pub async fn run_settings(
    config: EngineConfig,
    user_id: &str,
    trade_id: &str,
    args: SettingsCliConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let update = args.into_update()?;
    let engine = Engine::build(config, false, Some(user_id)).await?;
    let trade = engine
        .manager
        .update_settings(user_id, &TradeId::from(trade_id), update)
        .await?;
    print_trade(&trade)
}

/// Print the active trades of a user as a JSON array.
pub async fn run_list(config: EngineConfig, user_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::build(config, false, Some(user_id)).await?;
    let trades = engine.store.load_active_trades(user_id).await?;
    println!("{}", serde_json::to_string_pretty(&trades)?);
    Ok(())
}
