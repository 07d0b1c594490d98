use std::sync::Arc;

use tracing::info;

use crate::{
    config::Config,
    db::{create_pool, run_migrations},
    error::BootstrapError,
    guard::IdentityResolver,
    ledger::VoteLedger,
    notifier::ChangeNotifier,
    registry::Registry,
    store::{MemoryStore, PgStore, PollStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub ledger: VoteLedger,
    pub notifier: ChangeNotifier,
    pub identity: IdentityResolver,
    pub backend: &'static str,
}

impl AppState {
    pub fn new(store: Arc<dyn PollStore>, config: Config) -> Self {
        let notifier = ChangeNotifier::new(config.notifier_capacity);
        let identity = IdentityResolver::new(config.voter_identity, config.trust_forwarded_for);

        Self {
            backend: store.backend_tag(),
            registry: Registry::new(store.clone(), notifier.clone()),
            ledger: VoteLedger::new(store, notifier.clone()),
            notifier,
            identity,
            config: Arc::new(config),
        }
    }

    pub async fn from_config(config: Config) -> Result<Self, BootstrapError> {
        let store: Arc<dyn PollStore> = match &config.database_url {
            Some(url) => {
                info!("Connecting to database...");
                let pool = create_pool(url, config.database_max_connections).await?;
                run_migrations(&pool).await?;
                Arc::new(PgStore::new(pool))
            }
            None => Arc::new(MemoryStore::new()),
        };

        info!(
            backend = store.backend_tag(),
            identity = ?config.voter_identity,
            "Initialized state"
        );
        Ok(Self::new(store, config))
    }
}
