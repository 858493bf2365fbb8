//! CLI command handlers.
//!
//! This module contains the implementation for each CLI subcommand,
//! wiring the store, account registry, trade manager and scheduler.

mod engine;
mod monitor;
mod trade;

pub use engine::Engine;
pub use monitor::run_monitor;
pub use trade::{run_close, run_list, run_open, run_settings};
