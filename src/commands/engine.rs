//! Component wiring shared by every subcommand.

use std::sync::Arc;
use tracing::info;

use crate::collaborators::{CredentialStore, EnvCredentialStore, JsonFileStore, TracingNotifier};
use crate::config::EngineConfig;
use crate::registry::{BinanceSessionFactory, GatewayRegistry};
use crate::trade::TradeManager;

pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<JsonFileStore>,
    pub manager: Arc<TradeManager>,
    pub registry: Arc<GatewayRegistry>,
}

impl Engine {
    /// Build the engine on the JSON store in `config.data_dir`.
    ///
    /// With `single_user`, credentials from `BINANCE_API_KEY` /
    /// `BINANCE_API_SECRET` take precedence over the stored ones for that user.
    pub async fn build(
        config: EngineConfig,
        simulated: bool,
        single_user: Option<&str>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(JsonFileStore::open(config.data_dir.clone()).await?);

        let credentials: Arc<dyn CredentialStore> = match single_user {
            Some(user) => {
                let env = EnvCredentialStore::from_env(user);
                if env.credentials(user).await?.is_some() {
                    info!(user_id = user, "Using credentials from the environment");
                    Arc::new(env)
                } else {
                    store.clone()
                }
            }
            None => store.clone(),
        };

        let factory = BinanceSessionFactory::new(
            config.binance.clone(),
            config.retry.clone(),
            config.price_feed.clone(),
            config.fees.entry_rate,
        )
        .simulated(simulated);
        let registry = Arc::new(GatewayRegistry::new(Arc::new(factory), credentials));

        let manager = Arc::new(
            TradeManager::new(store.clone(), Arc::new(TracingNotifier::new()))
                .with_fees(config.fees.clone())
                .with_options(config.trading.evaluation_options()),
        );

        info!(
            data_dir = %config.data_dir.display(),
            rest_url = %config.binance.rest_url,
            simulated,
            "Engine ready"
        );

        Ok(Self {
            config,
            store,
            manager,
            registry,
        })
    }
}
