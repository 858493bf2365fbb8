//! Pair trade lifecycle: records, sizing, per-tick evaluation and the
//! manager that opens and closes trades against an account session.

mod error;
mod evaluation;
mod manager;
mod model;
pub mod sizing;

pub use error::TradeError;
pub use evaluation::{decide_close, evaluate, ratio_change_percent, Evaluation, EvaluationOptions};
pub use manager::{CloseClaim, FeeConfig, TradeManager, MAX_LEVERAGE};
pub use model::{
    default_trade_name, CloseReason, DownsideExit, Leg, OpenTradeRequest, PairTrade,
    RiskSettings, SettingsUpdate, TradeId, TradeStatus, UserId,
};
