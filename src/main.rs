use clap::Parser;
use dotenv::dotenv;

use pairtrader::cli::{Cli, Commands, OpenCliConfig, SettingsCliConfig};
use pairtrader::commands::{run_close, run_list, run_monitor, run_open, run_settings};
use pairtrader::config::EngineConfig;
use pairtrader::observability::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from the .env file
    dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.verbose, cli.log_json)?;

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Monitor { health_port, paper } => {
            run_monitor(config, health_port, paper).await?;
        }
        Commands::Open {
            user,
            long,
            short,
            max_loss,
            stop_loss,
            take_profit,
            trailing_level,
            long_leverage,
            short_leverage,
            margin_type,
            name,
            test_mode,
        } => {
            let args = OpenCliConfig {
                user,
                long,
                short,
                max_loss,
                stop_loss,
                take_profit,
                trailing_level,
                long_leverage,
                short_leverage,
                margin_type,
                name,
                test_mode,
            };
            run_open(config, args).await?;
        }
        Commands::Close { user, trade_id } => {
            run_close(config, &user, &trade_id).await?;
        }
        Commands::Settings {
            user,
            trade_id,
            take_profit,
            stop_loss,
            trailing_level,
            disable_trailing,
        } => {
            let args = SettingsCliConfig {
                take_profit,
                stop_loss,
                trailing_level,
                disable_trailing,
            };
            run_settings(config, &user, &trade_id, args).await?;
        }
        Commands::List { user } => {
            run_list(config, &user).await?;
        }
    }

    Ok(())
}
