mod health;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pulse_core::cipher::Cipher;
use pulse_core::config::PulseConfig;
use pulse_engine::clock::SystemClock;
use pulse_engine::messenger::LogMessenger;
use pulse_engine::scheduler::Scheduler;
use pulse_engine::jobs;
use pulse_engine::services::{NoopChartSource, Services};
use pulse_llm::anthropic::AnthropicProvider;
use pulse_llm::LlmClient;
use pulse_sources::exchange::RestExchangeConnector;
use pulse_sources::market::HttpMarketSource;
use pulse_sources::search::WebSearchSource;
use pulse_store::Store;
use pulse_vector::HttpVectorStore;

#[derive(Parser, Debug)]
#[command(name = "pulsed", about = "Per-user market monitoring daemon")]
struct Args {
    /// Path to pulsed.toml (defaults to ~/.pulse/pulsed.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = PulseConfig::load(args.config.as_deref()).context("config load failed")?;

    // Fatal configuration is checked before anything starts.
    let cipher =
        Cipher::from_base64(&config.security.encryption_key).context("encryption key invalid")?;
    let store = Arc::new(Store::open(&config.database.path).context("store open failed")?);

    let redis = match &config.cache.redis_url {
        Some(url) => pulse_cache::RedisCache::connect(url).await,
        None => None,
    };
    let cache = Arc::new(pulse_cache::TieredCache::new(redis));

    let llm_provider = Arc::new(AnthropicProvider::new(
        config.llm.api_key.clone(),
        config.llm.base_url.clone(),
    ));
    let llm = Arc::new(LlmClient::new(
        llm_provider,
        config.llm.fast_model.clone(),
        config.llm.deep_model.clone(),
    ));

    let services = Services {
        store: store.clone(),
        cache,
        market: Arc::new(HttpMarketSource::new(config.market.cryptopanic_api_key.clone())),
        connector: Arc::new(RestExchangeConnector::new(cipher)),
        llm,
        vector: Arc::new(HttpVectorStore::new(
            config.vector.api_key.clone(),
            config.vector.base_url.clone(),
            config.vector.embed_model.clone(),
        )),
        search: Arc::new(WebSearchSource::new(
            config.search.api_key.clone(),
            config.search.base_url.clone(),
        )),
        chart: Arc::new(NoopChartSource),
        // The channel adapter is a collaborator; until one is wired in,
        // outbound traffic lands in the log.
        messenger: Arc::new(LogMessenger),
        clock: Arc::new(SystemClock),
        monitor: config.monitor,
    };

    let scheduler = Arc::new(Scheduler::new(services.clock.clone()));
    jobs::register_all(&scheduler, &services);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let health_task = tokio::spawn(health::serve(
        config.health.clone(),
        health::HealthState {
            scheduler: scheduler.clone(),
            store,
        },
    ));

    info!("pulsed started");
    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    info!("shutdown signal received");

    // Cooperative stop: no new ticks, bounded drain inside run().
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    health_task.abort();

    info!("pulsed stopped");
    Ok(())
}
