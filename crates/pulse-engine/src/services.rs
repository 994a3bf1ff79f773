use std::sync::Arc;

use async_trait::async_trait;

use pulse_cache::Cache;
use pulse_core::config::MonitorConfig;
use pulse_llm::LlmClient;
use pulse_sources::exchange::ExchangeConnector;
use pulse_sources::market::MarketSource;
use pulse_sources::search::SearchSource;
use pulse_store::Store;
use pulse_vector::VectorStore;

use crate::clock::Clock;
use crate::messenger::Messenger;

/// Chart image capture for the collector's highest tier. The rendering
/// pipeline is a collaborator; absence simply yields no image.
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn capture(&self, symbol: &str) -> Option<Vec<u8>>;
}

pub struct NoopChartSource;

#[async_trait]
impl ChartSource for NoopChartSource {
    async fn capture(&self, _symbol: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Explicitly constructed component set threaded through the engine.
/// There is no hidden module state beyond what the scheduler owns.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<Store>,
    pub cache: Arc<dyn Cache>,
    pub market: Arc<dyn MarketSource>,
    pub connector: Arc<dyn ExchangeConnector>,
    pub llm: Arc<LlmClient>,
    pub vector: Arc<dyn VectorStore>,
    pub search: Arc<dyn SearchSource>,
    pub chart: Arc<dyn ChartSource>,
    pub messenger: Arc<dyn Messenger>,
    pub clock: Arc<dyn Clock>,
    pub monitor: MonitorConfig,
}
