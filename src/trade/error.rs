//! Trade lifecycle errors.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::collaborators::StoreError;
use crate::exchange::ExchangeError;
use crate::price_feed::PriceFeedError;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Long and short legs must use different symbols (got {0} twice)")]
    SameSymbol(String),

    #[error("Unknown or non-trading symbol: {0}")]
    UnknownSymbol(String),

    #[error("Insufficient margin: available {available}, required {required}, short by {deficit}")]
    InsufficientMargin {
        available: Decimal,
        required: Decimal,
        deficit: Decimal,
    },

    #[error("Price unavailable for {symbol}: {source}")]
    PriceUnavailable {
        symbol: String,
        #[source]
        source: PriceFeedError,
    },

    #[error("Long leg order on {symbol} failed: {source}")]
    LongLegFailed {
        symbol: String,
        #[source]
        source: ExchangeError,
    },

    #[error("Short leg order on {symbol} failed ({source}); long leg was closed back")]
    ShortLegCompensated {
        symbol: String,
        #[source]
        source: ExchangeError,
    },

    #[error(
        "Short leg failed and compensating close of {quantity} {long_symbol} also failed; \
         trade {trade_id} marked failed, manual close required"
    )]
    CompensationFailed {
        trade_id: String,
        long_symbol: String,
        quantity: Decimal,
        #[source]
        source: ExchangeError,
    },

    #[error("Close of trade {trade_id} only partially completed; open leg: {open_leg}")]
    PartialClose {
        trade_id: String,
        open_leg: String,
        #[source]
        source: ExchangeError,
    },

    #[error("Trade {0} is not active")]
    NotActive(String),

    #[error("Trade {0} not found")]
    NotFound(String),

    #[error("Trade {0} is already being closed")]
    CloseInProgress(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
