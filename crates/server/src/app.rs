//! Process wiring: the state store, broker, scheduler and consumer built from
//! one [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DurationRound, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use siphon_consumer::{ConsumerConfig, ConsumerWorker};
use siphon_core::config::{BrokerConfig, SourceConfig};
use siphon_core::Config;
use siphon_ingest::{HttpSource, ItemSource, Normalizer, ProducerConfig, ProducerTask, StaticSource};
use siphon_queue::{Broker, MemoryBroker, SqlBroker};
use siphon_scheduler::{
    PipelineFile, Scheduler, SchedulerConfig, SchedulerError, TaskAction, TaskDef, PRODUCE_ACTION,
};
use siphon_storage::SqlitePool;

/// Which long-running loops a process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Components {
    /// Scheduler, consumer and admin HTTP in one process.
    All,
    /// Scheduler and admin HTTP.
    Scheduler,
    Consumer,
}

impl Components {
    fn scheduler(self) -> bool {
        matches!(self, Self::All | Self::Scheduler)
    }

    fn consumer(self) -> bool {
        matches!(self, Self::All | Self::Consumer)
    }
}

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub broker: Arc<dyn Broker>,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    /// Open the state store and broker and load the pipeline named in
    /// `config`.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let pool = siphon_storage::connect(&config.store)
            .await
            .context("opening state store")?;
        let broker = open_broker(&config.broker, &pool).await?;
        let pipeline = load_pipeline(&config)?;
        let source = open_source(&config.source, &pipeline)?;
        Self::assemble(config, pool, broker, source, pipeline)
    }

    /// Bind every pipeline task to a producer over `source` and `broker`.
    pub fn assemble(
        config: Config,
        pool: SqlitePool,
        broker: Arc<dyn Broker>,
        source: Arc<dyn ItemSource>,
        pipeline: PipelineFile,
    ) -> anyhow::Result<Self> {
        let scheduler_config = pipeline
            .scheduler
            .clone()
            .unwrap_or_else(|| SchedulerConfig::from_settings(&config.scheduler));

        let mut tasks: Vec<(_, Arc<dyn TaskAction>)> = Vec::with_capacity(pipeline.tasks.len());
        for def in &pipeline.tasks {
            let spec = def.to_spec(&scheduler_config.retry)?;
            let action = producer_for(def, &config, source.clone(), broker.clone())?;
            tasks.push((spec, action));
        }
        let scheduler = Scheduler::new(scheduler_config, pool.clone(), tasks)?;

        Ok(Self {
            config,
            pool,
            broker,
            scheduler: Arc::new(scheduler),
        })
    }

    pub fn consumer(&self) -> ConsumerWorker {
        let config = ConsumerConfig::from_settings(&self.config.consumer, &self.config.broker.topic);
        ConsumerWorker::new(self.broker.clone(), self.pool.clone(), config)
    }

    /// Drive the selected loops until `shutdown` fires or one of them fails.
    pub async fn run(
        self: Arc<Self>,
        components: Components,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut loops: JoinSet<anyhow::Result<()>> = JoinSet::new();

        if components.scheduler() {
            let scheduler = self.scheduler.clone();
            let token = shutdown.clone();
            loops.spawn(async move { scheduler.run(token).await.context("scheduler") });

            let app = self.clone();
            let token = shutdown.clone();
            loops.spawn(async move { app.serve_admin(token).await.context("admin http") });
        }
        if components.consumer() {
            let worker = self.consumer();
            let token = shutdown.clone();
            loops.spawn(async move {
                let stats = worker.run(token).await.context("consumer")?;
                info!(
                    batches = stats.batches,
                    messages = stats.messages,
                    dead_lettered = stats.dead_lettered,
                    "consumer totals"
                );
                Ok(())
            });
        }

        let mut failure = None;
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined.map_err(anyhow::Error::from).and_then(|r| r) {
                error!(error = %e, "component stopped with an error; shutting down");
                shutdown.cancel();
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Serve the admin router until `shutdown` fires.
    pub async fn serve_admin(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.admin.host, self.config.admin.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding admin listener on {addr}"))?;
        info!("Admin API listening on http://{}", addr);

        let router = crate::router::build_router(self);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn open_broker(config: &BrokerConfig, pool: &SqlitePool) -> anyhow::Result<Arc<dyn Broker>> {
    if config.durable {
        let broker = SqlBroker::new(pool.clone(), config.partitions).await?;
        Ok(Arc::new(broker))
    } else {
        warn!("Using the in-memory broker: unconsumed records are lost on exit");
        Ok(Arc::new(MemoryBroker::new(config.partitions)))
    }
}

/// The HTTP source, or an empty static source serving every collection the
/// pipeline names when no base URL is configured.
fn open_source(config: &SourceConfig, pipeline: &PipelineFile) -> anyhow::Result<Arc<dyn ItemSource>> {
    if let Some(url) = &config.base_url {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        return Ok(Arc::new(HttpSource::new(url.clone(), timeout, config.api_token.clone())?));
    }
    warn!("SOURCE_BASE_URL not set; producer runs have no items to fetch");
    let source = StaticSource::new();
    for collection in pipeline.tasks.iter().filter_map(|t| t.collection.as_deref()) {
        source.set_items(collection, Vec::new());
    }
    Ok(Arc::new(source))
}

/// The configured pipeline file, or a backfill + hourly harvest pair per
/// source collection anchored at the current hour.
fn load_pipeline(config: &Config) -> anyhow::Result<PipelineFile> {
    if let Some(path) = &config.scheduler.pipeline_file {
        info!(path = %path, "loading pipeline file");
        return Ok(PipelineFile::from_file(path)?);
    }
    let start = Utc::now()
        .duration_trunc(chrono::Duration::hours(1))
        .unwrap_or_else(|_| Utc::now());
    info!(
        collections = ?config.source.collections,
        start_date = %start,
        "using built-in pipeline"
    );
    Ok(PipelineFile::default_for(&config.source.collections, start))
}

fn producer_for(
    def: &TaskDef,
    config: &Config,
    source: Arc<dyn ItemSource>,
    broker: Arc<dyn Broker>,
) -> Result<Arc<dyn TaskAction>, SchedulerError> {
    if def.action != PRODUCE_ACTION {
        return Err(SchedulerError::Pipeline(format!(
            "task '{}': unknown action '{}'",
            def.name, def.action
        )));
    }
    let collection = def.collection.clone().ok_or_else(|| {
        SchedulerError::Pipeline(format!("task '{}': produce needs a collection", def.name))
    })?;

    let producer_config = ProducerConfig {
        page_size: config.source.page_size.max(1),
        max_items: config.source.max_items_per_run.max(1),
        publish_timeout: Duration::from_millis(config.broker.publish_timeout_ms),
        ..ProducerConfig::new(collection, config.broker.topic.clone())
    };
    let normalizer = Normalizer::new(config.source.id_field.clone(), config.source.scope_field.clone());
    Ok(Arc::new(ProducerTask::new(source, broker, normalizer, producer_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use siphon_ingest::FetchWindow;

    fn pipeline(text: &str) -> PipelineFile {
        PipelineFile::parse(text).unwrap()
    }

    #[tokio::test]
    async fn assemble_binds_producers() {
        let config = Config::for_profile("");
        let pool = siphon_storage::in_memory().await.unwrap();
        let file = PipelineFile::default_for(&["rust".into()], Utc::now());

        let app = App::assemble(
            config,
            pool,
            Arc::new(MemoryBroker::new(1)),
            Arc::new(StaticSource::new()),
            file,
        )
        .unwrap();
        assert_eq!(app.scheduler.graph().len(), 2);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let text = "[[task]]\nname = \"x\"\naction = \"compact\"\nonce = true\n";
        let result = App::assemble(
            Config::for_profile(""),
            siphon_storage::in_memory().await.unwrap(),
            Arc::new(MemoryBroker::new(1)),
            Arc::new(StaticSource::new()),
            pipeline(text),
        );
        let err = result.err().unwrap();
        assert!(err.to_string().contains("unknown action 'compact'"));
    }

    #[tokio::test]
    async fn produce_requires_a_collection() {
        let text = "[[task]]\nname = \"x\"\naction = \"produce\"\nonce = true\n";
        let result = App::assemble(
            Config::for_profile(""),
            siphon_storage::in_memory().await.unwrap(),
            Arc::new(MemoryBroker::new(1)),
            Arc::new(StaticSource::new()),
            pipeline(text),
        );
        assert!(result.err().unwrap().to_string().contains("needs a collection"));
    }

    #[tokio::test]
    async fn missing_base_url_serves_empty_collections() {
        let config = Config::for_profile("");
        let mut settings = config.source.clone();
        settings.base_url = None;
        let file = PipelineFile::default_for(&["rust".into(), "golang".into()], Utc::now());

        let source = open_source(&settings, &file).unwrap();
        let window = FetchWindow {
            after: Utc::now() - chrono::Duration::hours(1),
            before: Utc::now(),
        };
        for collection in ["rust", "golang"] {
            let page = source.fetch_page(collection, &window, None, 10).await.unwrap();
            assert!(page.items.is_empty());
            assert!(page.next.is_none());
        }
        assert!(source.fetch_page("python", &window, None, 10).await.is_err());
    }

    #[test]
    fn components_select_loops() {
        assert!(Components::All.scheduler() && Components::All.consumer());
        assert!(!Components::Consumer.scheduler());
        assert!(!Components::Scheduler.consumer());
    }
}
