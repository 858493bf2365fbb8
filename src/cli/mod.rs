//! CLI argument parsing using clap.
//!
//! This module defines the command-line interface for pairtrader,
//! including all subcommands and their arguments.

mod config;

pub use config::{CliConfigError, OpenCliConfig, SettingsCliConfig};

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

/// pairtrader - delta-neutral pair trades on USDT-M futures
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub verbose: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    /// Path to a JSON engine configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory of the JSON store (overrides config and PAIRTRADER_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Monitor every active trade until Ctrl-C
    Monitor {
        /// Port of the /health and /metrics endpoint
        #[arg(long)]
        health_port: Option<u16>,
        /// Route every trade through the simulated gateway
        #[arg(long, default_value_t = false)]
        paper: bool,
    },

    /// Open a pair trade (long one symbol, short the other)
    Open {
        /// Account id
        #[arg(long)]
        user: String,
        /// Symbol to buy (e.g., "BTC" or "BTCUSDT")
        #[arg(long)]
        long: String,
        /// Symbol to sell
        #[arg(long)]
        short: String,
        /// Loss in USDT that equals 1R
        #[arg(long)]
        max_loss: Decimal,
        /// Stop-loss percent, also used for sizing
        #[arg(long)]
        stop_loss: Decimal,
        /// Take-profit percent on the ratio change
        #[arg(long)]
        take_profit: Decimal,
        /// Switch the downside exit to a trailing profit floor at this percent
        #[arg(long)]
        trailing_level: Option<Decimal>,
        /// Leverage of the long leg (defaults to the configured leverage)
        #[arg(long)]
        long_leverage: Option<u32>,
        /// Leverage of the short leg (defaults to the configured leverage)
        #[arg(long)]
        short_leverage: Option<u32>,
        /// Margin type: isolated or crossed
        #[arg(long)]
        margin_type: Option<String>,
        /// Optional display name
        #[arg(long)]
        name: Option<String>,
        /// Execute on the simulated gateway
        #[arg(long, default_value_t = false)]
        test_mode: bool,
    },

    /// Close an active trade at market
    Close {
        #[arg(long)]
        user: String,
        #[arg(long)]
        trade_id: String,
    },

    /// Change the exit settings of an active trade
    Settings {
        #[arg(long)]
        user: String,
        #[arg(long)]
        trade_id: String,
        #[arg(long)]
        take_profit: Option<Decimal>,
        #[arg(long)]
        stop_loss: Option<Decimal>,
        /// Switch to (or move) the trailing profit floor
        #[arg(long, conflicts_with = "disable_trailing")]
        trailing_level: Option<Decimal>,
        /// Switch back to the fixed stop-loss
        #[arg(long, default_value_t = false)]
        disable_trailing: bool,
    },

    /// Print the active trades of a user as JSON
    List {
        #[arg(long)]
        user: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_open() {
        let cli = Cli::parse_from([
            "pairtrader",
            "open",
            "--user",
            "alice",
            "--long",
            "btc",
            "--short",
            "eth",
            "--max-loss",
            "100",
            "--stop-loss",
            "5",
            "--take-profit",
            "10",
            "--trailing-level",
            "2",
            "--test-mode",
        ]);
        match cli.command {
            Commands::Open {
                user,
                max_loss,
                trailing_level,
                long_leverage,
                test_mode,
                ..
            } => {
                assert_eq!(user, "alice");
                assert_eq!(max_loss, dec!(100));
                assert_eq!(trailing_level, Some(dec!(2)));
                assert_eq!(long_leverage, None);
                assert!(test_mode);
            }
            _ => panic!("expected open"),
        }
    }

    #[test]
    fn test_trailing_flags_conflict() {
        let result = Cli::try_parse_from([
            "pairtrader",
            "settings",
            "--user",
            "alice",
            "--trade-id",
            "t1",
            "--trailing-level",
            "2",
            "--disable-trailing",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["pairtrader", "monitor", "--paper", "--log-json", "--data-dir", "/tmp/pt"]);
        assert!(cli.log_json);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/pt")));
        assert!(matches!(cli.command, Commands::Monitor { paper: true, health_port: None }));
    }
}
