use std::sync::Arc;

use sqlx::SqlitePool;

use crate::configuration::Settings;
use crate::notifier::SubscriberNotifier;
use crate::object_store::FsObjectStore;
use crate::object_store::ObjectStore;
use crate::payer_client::PayerClient;
use crate::pipeline::PipelineDefinition;

/// Everything a stage handler or worker needs, composed explicitly. No
/// globals: the HTTP app holds one of these behind `web::Data`, each
/// worker process holds its own.
pub struct Deps {
    pub pool: SqlitePool,
    pub store: Arc<dyn ObjectStore>,
    pub payer: PayerClient,
    pub notifier: SubscriberNotifier,
    pub pipeline: PipelineDefinition,
    pub settings: Settings,
}

impl Deps {
    pub fn new(settings: Settings, pool: SqlitePool) -> Self {
        Self {
            pool,
            store: FsObjectStore::shared(&settings.object_store),
            payer: PayerClient::new(&settings.payer),
            notifier: SubscriberNotifier::new(&settings.subscribers),
            pipeline: PipelineDefinition::standard(),
            settings,
        }
    }
}
