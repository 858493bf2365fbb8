//! Order Management Module
//!
//! Core types - `OrderId`, `OrderState`, `OrderFill`.

mod types;

pub use types::{OrderFill, OrderId, OrderState};
