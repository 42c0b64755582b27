use std::sync::Arc;

use anyhow::{Context, Result};
use skb_core::sync::spawn_schedule;
use skb_core::tasks::TaskManager;
use skb_core::{
    Config, DialogPipeline, InMemoryStore, InteractionDesk, PendingStore, QuietPeriodAggregator,
    Router, SharedAnalysis, SharedSink, SharedStore, SharedTransport, SyncCoordinator,
};
use tracing::{info, warn};

use crate::http_client;
use crate::openrouter::OpenRouterClient;
use crate::postgrest::PostgrestStore;
use crate::webhook::WebhookSink;

pub struct BootstrapOutput {
    pub router: Arc<Router>,
    pub aggregator: QuietPeriodAggregator,
    pub background_tasks: TaskManager,
}

fn build_store(config: &Config, http: &reqwest::Client) -> SharedStore {
    match (&config.store.url, &config.store.service_key) {
        (Some(url), Some(key)) => {
            info!(target: "skb::desk", url = %url, "using PostgREST store");
            Arc::new(PostgrestStore::new(http.clone(), url, key.clone()))
        }
        _ => {
            warn!(
                target: "skb::desk",
                "SKB_STORE_URL / SKB_STORE_KEY not set; knowledge records live in memory only"
            );
            Arc::new(InMemoryStore::new())
        }
    }
}

fn build_sink(config: &Config, http: &reqwest::Client) -> Option<SharedSink> {
    let url = config.sync.sink_url.as_ref()?;
    let sink: SharedSink = Arc::new(WebhookSink::new(
        http.clone(),
        url.clone(),
        config.sync.sink_token.clone(),
    ));
    Some(sink)
}

/// Insert the configured default categories into an empty store.
async fn seed_categories(store: &SharedStore, config: &Config) -> Result<()> {
    let existing = store
        .list_categories()
        .await
        .context("list categories")?;
    if !existing.is_empty() {
        return Ok(());
    }
    for category in &config.categories.defaults {
        store
            .add_category(category.clone())
            .await
            .with_context(|| format!("seed category {}", category.name))?;
    }
    info!(
        target: "skb::desk",
        count = config.categories.defaults.len(),
        "seeded default categories"
    );
    Ok(())
}

pub async fn build(config: &Config, transport: SharedTransport) -> Result<BootstrapOutput> {
    let http = http_client::client()?;
    if config.analysis.api_key.is_none() {
        warn!(target: "skb::desk", "SKB_ANALYSIS_API_KEY not set; analysis calls will fail");
    }
    let analysis: SharedAnalysis = Arc::new(OpenRouterClient::new(http.clone(), &config.analysis));
    let store = build_store(config, &http);
    if let Err(err) = seed_categories(&store, config).await {
        warn!(target: "skb::desk", error = %format!("{err:#}"), "category seeding skipped");
    }

    let pipeline = Arc::new(DialogPipeline::new(
        analysis.clone(),
        store.clone(),
        config.categories.fallback.clone(),
        config.analysis.embedding_max_chars,
    ));
    let aggregator = QuietPeriodAggregator::new(config.quiet_period(), pipeline.clone());
    let pending = Arc::new(PendingStore::new(config.pending_ttl()));
    let desk = Arc::new(
        InteractionDesk::new(
            analysis,
            store.clone(),
            pipeline.clone(),
            pending,
            config.search.match_count,
            config.analysis.embedding_max_chars,
        )
        .with_answer_options(config.answer_options()),
    );
    let sync = Arc::new(SyncCoordinator::new(
        store.clone(),
        build_sink(config, &http),
        config.sync_retry_policy(),
    ));

    let mut background_tasks = TaskManager::new();
    if sync.is_enabled() {
        background_tasks.push(spawn_schedule(sync.clone(), config.sync_interval()));
    }

    let router = Arc::new(Router::new(
        config.access.allowed_operators.iter().copied(),
        aggregator.clone(),
        desk,
        pipeline,
        store,
        sync,
        transport,
    ));
    info!(
        target: "skb::desk",
        quiet_period_secs = config.quiet_period().as_secs(),
        pending_ttl_secs = config.pending_ttl().as_secs(),
        sync_interval_mins = config.sync.interval_mins,
        operators = config.access.allowed_operators.len(),
        "desk ready"
    );
    Ok(BootstrapOutput {
        router,
        aggregator,
        background_tasks,
    })
}
