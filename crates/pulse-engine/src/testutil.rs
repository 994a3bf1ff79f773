//! Shared in-crate test fixtures: scripted capability implementations and
//! a Services builder over an in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use pulse_core::config::MonitorConfig;
use pulse_store::Store;

use crate::clock::ManualClock;
use crate::messenger::{Keyboard, Messenger};
use crate::services::{NoopChartSource, Services};

/// Market source answering from a fixed table keyed by "type/symbol".
#[derive(Default)]
pub struct TableMarket {
    pub values: Mutex<HashMap<String, Value>>,
}

impl TableMarket {
    pub fn put(&self, stream_type: &str, symbol: Option<&str>, value: Value) {
        let key = format!("{stream_type}/{}", symbol.unwrap_or("all"));
        self.values.lock().unwrap().insert(key, value);
    }
}

#[async_trait]
impl pulse_sources::market::MarketSource for TableMarket {
    async fn fetch(
        &self,
        stream_type: &str,
        symbol: Option<&str>,
        _config: Option<&Value>,
    ) -> Option<Value> {
        let key = format!("{stream_type}/{}", symbol.unwrap_or("all"));
        self.values.lock().unwrap().get(&key).cloned()
    }
}

/// LLM provider replaying a queue of canned responses.
#[derive(Default)]
pub struct ScriptedLlm {
    pub responses: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<pulse_llm::LlmRequest>>,
}

impl ScriptedLlm {
    pub fn push(&self, response: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(response.to_string());
    }
}

#[async_trait]
impl pulse_llm::LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        req: &pulse_llm::LlmRequest,
    ) -> Result<pulse_llm::LlmResponse, pulse_llm::ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| pulse_llm::ProviderError::Parse("no scripted response".to_string()))?;
        Ok(pulse_llm::LlmResponse {
            text,
            usage: pulse_llm::LlmUsage::default(),
            model: req.model.clone(),
            stop_reason: "end_turn".to_string(),
        })
    }
}

/// Vector store recording upserts, answering queries from a canned list.
#[derive(Default)]
pub struct RecordingVector {
    pub upserts: Mutex<Vec<(String, i64, String)>>,
    pub query_results: Mutex<Vec<i64>>,
}

#[async_trait]
impl pulse_vector::VectorStore for RecordingVector {
    async fn upsert(
        &self,
        namespace: &str,
        episode_id: i64,
        text: &str,
        _metadata: &Value,
    ) -> pulse_vector::Result<String> {
        self.upserts.lock().unwrap().push((
            namespace.to_string(),
            episode_id,
            text.to_string(),
        ));
        Ok(pulse_vector::episode_vector_id(episode_id))
    }

    async fn query(
        &self,
        _namespace: &str,
        _text: &str,
        top_k: usize,
    ) -> pulse_vector::Result<Vec<i64>> {
        let results = self.query_results.lock().unwrap();
        Ok(results.iter().take(top_k).copied().collect())
    }

    async fn delete(&self, _namespace: &str, _episode_id: i64) -> pulse_vector::Result<()> {
        Ok(())
    }
}

/// Vector store that always fails — for best-effort-path tests.
pub struct FailingVector;

#[async_trait]
impl pulse_vector::VectorStore for FailingVector {
    async fn upsert(
        &self,
        _namespace: &str,
        _episode_id: i64,
        _text: &str,
        _metadata: &Value,
    ) -> pulse_vector::Result<String> {
        Err(pulse_vector::VectorError::NotConfigured)
    }

    async fn query(
        &self,
        _namespace: &str,
        _text: &str,
        _top_k: usize,
    ) -> pulse_vector::Result<Vec<i64>> {
        Err(pulse_vector::VectorError::NotConfigured)
    }

    async fn delete(&self, _namespace: &str, _episode_id: i64) -> pulse_vector::Result<()> {
        Err(pulse_vector::VectorError::NotConfigured)
    }
}

/// Messenger capturing every outbound message for assertions.
#[derive(Default)]
pub struct RecordingMessenger {
    pub texts: Mutex<Vec<(String, String, bool)>>,
    pub photos: Mutex<Vec<(String, usize)>>,
}

impl RecordingMessenger {
    pub fn sent_texts(&self) -> Vec<String> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text, _)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, recipient: &str, text: &str, keyboard: Option<&Keyboard>) {
        self.texts.lock().unwrap().push((
            recipient.to_string(),
            text.to_string(),
            keyboard.is_some(),
        ));
    }

    async fn send_photo(&self, recipient: &str, bytes: &[u8], _caption: Option<&str>) {
        self.photos
            .lock()
            .unwrap()
            .push((recipient.to_string(), bytes.len()));
    }

    async fn edit_text(&self, _handle: &str, _text: &str) {}
}

/// Scripted exchange: fixed orders, two-phase balances, fixed tickers.
#[derive(Default)]
pub struct ScriptedExchange {
    pub orders: Mutex<Vec<pulse_sources::exchange::OrderRecord>>,
    pub balances: Mutex<HashMap<String, f64>>,
    pub tickers: Mutex<HashMap<String, f64>>,
}

#[async_trait]
impl pulse_sources::exchange::ExchangeSource for ScriptedExchange {
    fn name(&self) -> &str {
        "binance"
    }

    async fn list_orders_since(
        &self,
        since_ms: i64,
    ) -> pulse_sources::Result<Vec<pulse_sources::exchange::OrderRecord>> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.timestamp_ms >= since_ms)
            .cloned()
            .collect())
    }

    async fn fetch_balances(&self) -> pulse_sources::Result<HashMap<String, f64>> {
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn fetch_positions(
        &self,
    ) -> pulse_sources::Result<Vec<pulse_sources::exchange::PositionRecord>> {
        Ok(Vec::new())
    }

    async fn fetch_ticker(
        &self,
        symbol: &str,
    ) -> pulse_sources::Result<pulse_sources::exchange::Ticker> {
        self.tickers
            .lock()
            .unwrap()
            .get(symbol)
            .map(|last| pulse_sources::exchange::Ticker { last: *last })
            .ok_or_else(|| pulse_sources::SourceError::Parse(format!("no ticker for {symbol}")))
    }
}

/// Connector handing out one shared scripted exchange per venue name.
#[derive(Default)]
pub struct ScriptedConnector {
    pub exchanges: Mutex<HashMap<String, Arc<ScriptedExchange>>>,
}

impl ScriptedConnector {
    pub fn install(&self, exchange: &str) -> Arc<ScriptedExchange> {
        let shared = Arc::new(ScriptedExchange::default());
        self.exchanges
            .lock()
            .unwrap()
            .insert(exchange.to_string(), shared.clone());
        shared
    }
}

struct SharedExchange(Arc<ScriptedExchange>);

#[async_trait]
impl pulse_sources::exchange::ExchangeSource for SharedExchange {
    fn name(&self) -> &str {
        self.0.name()
    }
    async fn list_orders_since(
        &self,
        since_ms: i64,
    ) -> pulse_sources::Result<Vec<pulse_sources::exchange::OrderRecord>> {
        self.0.list_orders_since(since_ms).await
    }
    async fn fetch_balances(&self) -> pulse_sources::Result<HashMap<String, f64>> {
        self.0.fetch_balances().await
    }
    async fn fetch_positions(
        &self,
    ) -> pulse_sources::Result<Vec<pulse_sources::exchange::PositionRecord>> {
        self.0.fetch_positions().await
    }
    async fn fetch_ticker(
        &self,
        symbol: &str,
    ) -> pulse_sources::Result<pulse_sources::exchange::Ticker> {
        self.0.fetch_ticker(symbol).await
    }
}

impl pulse_sources::exchange::ExchangeConnector for ScriptedConnector {
    fn connect(
        &self,
        exchange: &str,
        _api_key_enc: &[u8],
        _api_secret_enc: &[u8],
    ) -> pulse_sources::Result<Box<dyn pulse_sources::exchange::ExchangeSource>> {
        self.exchanges
            .lock()
            .unwrap()
            .get(exchange)
            .map(|shared| {
                Box::new(SharedExchange(shared.clone()))
                    as Box<dyn pulse_sources::exchange::ExchangeSource>
            })
            .ok_or_else(|| {
                pulse_sources::SourceError::UnsupportedExchange(exchange.to_string())
            })
    }
}

#[derive(Default)]
pub struct CannedSearch {
    pub result: Option<String>,
}

#[async_trait]
impl pulse_sources::search::SearchSource for CannedSearch {
    async fn search(&self, _query: &str, _language: &str) -> Option<String> {
        self.result.clone()
    }
}

/// Everything a test harness needs to drive the engine.
pub struct TestHarness {
    pub services: Services,
    pub clock: Arc<ManualClock>,
    pub market: Arc<TableMarket>,
    pub llm: Arc<ScriptedLlm>,
    pub vector: Arc<RecordingVector>,
    pub messenger: Arc<RecordingMessenger>,
    pub connector: Arc<ScriptedConnector>,
}

pub fn harness() -> TestHarness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap(),
    ));
    let market = Arc::new(TableMarket::default());
    let llm = Arc::new(ScriptedLlm::default());
    let vector = Arc::new(RecordingVector::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let connector = Arc::new(ScriptedConnector::default());

    let services = Services {
        store: Arc::new(Store::open_in_memory().unwrap()),
        cache: Arc::new(pulse_cache::MemoryCache::default()),
        market: market.clone(),
        connector: connector.clone(),
        llm: Arc::new(pulse_llm::LlmClient::new(
            llm.clone(),
            "fast-model".to_string(),
            "deep-model".to_string(),
        )),
        vector: vector.clone(),
        search: Arc::new(CannedSearch::default()),
        chart: Arc::new(NoopChartSource),
        messenger: messenger.clone(),
        clock: clock.clone(),
        monitor: MonitorConfig::default(),
    };

    TestHarness {
        services,
        clock,
        market,
        llm,
        vector,
        messenger,
        connector,
    }
}

/// A stage-4 active user ready for monitoring.
pub fn monitored_user(services: &Services, external_id: &str) -> pulse_store::types::User {
    let now = services.clock.now_utc();
    let user = services
        .store
        .create_user(external_id, None, "ko", now)
        .unwrap();
    services.store.set_onboarding_stage(user.id, 4).unwrap();
    services.store.touch_last_active(user.id, now).unwrap();
    services.store.user(user.id).unwrap()
}
