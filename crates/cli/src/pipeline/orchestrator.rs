//! Platform orchestrator - coordinates all components.
//!
//! Startup: broker → subscription manager + producer pool → ingestion engine
//! → dataset router → (synthetic load).
//! Shutdown: load → ingestion drain → router → `ProducerPool::shutdown()`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use broker::{InMemoryBroker, MemoryBrokerConfig};
use contracts::{AckPolicy, PlatformConfig, StorageSink};
use ingestion::{IngestionEngine, IngestionHandle};
use producer_pool::ProducerPool;
use router::{DatasetRouter, RouterHandle};
use storage::{JsonlStore, JsonlStoreConfig, MemoryStore};
use subscription::{SubscriptionManager, SubscriptionSettings};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::load::{self, LoadReport, LoadTargets, SyntheticLoadConfig};
use super::PlatformStats;
use crate::cli::StorageKind;

/// Platform configuration
#[derive(Debug, Clone)]
pub struct PlatformOptions {
    /// Effective data-plane configuration (file + environment)
    pub config: PlatformConfig,

    pub storage: StorageKind,

    /// jsonl backend output directory
    pub data_dir: PathBuf,

    /// Synthetic load (None = disabled)
    pub synthetic: Option<SyntheticLoadConfig>,

    /// Run timeout (None = no timeout)
    pub timeout: Option<Duration>,

    pub health_interval: Duration,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

#[derive(Debug)]
enum StopReason {
    Signal,
    Timeout,
    Drained,
    Unhealthy(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Timeout => write!(f, "timeout"),
            Self::Drained => write!(f, "synthetic load drained"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// Main platform orchestrator
pub struct Platform {
    options: PlatformOptions,
}

impl Platform {
    pub fn new(options: PlatformOptions) -> Self {
        Self { options }
    }

    /// Run until `stop` resolves, the timeout expires, the synthetic load is
    /// drained, or a component fails
    ///
    /// # Errors
    /// Startup failure, or a component that terminated abnormally (the
    /// process exits non-zero so a supervisor restarts it).
    pub async fn run(self, stop: impl Future<Output = ()>) -> Result<PlatformStats> {
        if let Some(port) = self.options.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        match self.options.storage {
            StorageKind::Memory => {
                info!("Using in-memory storage");
                let store = Arc::new(MemoryStore::new("memory"));
                self.run_with_store(store, stop).await
            }
            StorageKind::Jsonl => {
                let store = JsonlStore::open("jsonl", JsonlStoreConfig::new(&self.options.data_dir))
                    .with_context(|| {
                        format!(
                            "Failed to open jsonl store at {}",
                            self.options.data_dir.display()
                        )
                    })?;
                self.run_with_store(Arc::new(store), stop).await
            }
        }
    }

    async fn run_with_store<S>(
        self,
        store: Arc<S>,
        stop: impl Future<Output = ()>,
    ) -> Result<PlatformStats>
    where
        S: StorageSink + Sync + 'static,
    {
        let start_time = Instant::now();
        let config = &self.options.config;

        info!(
            instance_id = %config.instance_id,
            store = store.name(),
            "Starting data-plane"
        );

        let broker = InMemoryBroker::with_config(MemoryBrokerConfig::from(&config.broker));
        let subscriptions = Arc::new(SubscriptionManager::new(
            broker.clone(),
            SubscriptionSettings::from_config(config),
        ));
        let pool = Arc::new(ProducerPool::new(broker, &config.producer_pool));

        let ingest_token = CancellationToken::new();
        let router_token = CancellationToken::new();
        let load_token = CancellationToken::new();

        // Ingestion Engine
        let ingest = if config.ingest.enabled {
            let engine = IngestionEngine::new(
                config.ingest.clone(),
                Arc::clone(&subscriptions),
                Arc::clone(&pool),
                store,
            );
            let handle = engine
                .spawn(ingest_token.clone())
                .await
                .context("Failed to start ingestion engine")?;
            info!(topics = ?config.ingest.source_topics, "Ingestion engine started");
            Some(handle)
        } else {
            warn!("Ingestion engine disabled");
            None
        };

        // Dataset Router
        let router = if config.router.enabled {
            let router = DatasetRouter::new(
                config.router.clone(),
                Arc::clone(&subscriptions),
                Arc::clone(&pool),
            );
            match router.spawn(router_token.clone()).await {
                Ok(handle) => {
                    info!(topic = %config.router.global_topic, "Dataset router started");
                    Some(handle)
                }
                Err(e) => {
                    ingest_token.cancel();
                    if let Some(handle) = ingest {
                        let _ = handle.join().await;
                    }
                    pool.shutdown().await;
                    return Err(e).context("Failed to start dataset router");
                }
            }
        } else {
            warn!("Dataset router disabled");
            None
        };

        // Synthetic load
        let load_task: Option<JoinHandle<LoadReport>> =
            self.options.synthetic.clone().map(|load_config| {
                let targets = LoadTargets {
                    source_topics: if config.ingest.enabled {
                        config.ingest.source_topics.clone()
                    } else {
                        Vec::new()
                    },
                    global_topic: config
                        .router
                        .enabled
                        .then(|| config.router.global_topic.clone()),
                };
                info!(events = load_config.events, "Starting synthetic load");
                tokio::spawn(load::run(
                    load_config,
                    targets,
                    Arc::clone(&pool),
                    load_token.clone(),
                ))
            });

        let (reason, load_task, load_report) = self
            .monitor(stop, ingest.as_ref(), router.as_ref(), load_task)
            .await;
        info!(reason = %reason, "Shutting down data-plane...");

        // 1. stop the load generator
        load_token.cancel();
        let load_report = match (load_report, load_task) {
            (Some(report), _) => Some(report),
            (None, Some(task)) => task.await.ok(),
            (None, None) => None,
        };

        // 2. drain ingestion windows (persist + DLQ + ack)
        ingest_token.cancel();
        let (ingest_result, ingest_stats, windows) = match ingest {
            Some(handle) => {
                let metrics = handle.metrics();
                let result = handle.join().await;
                (
                    result.map_err(anyhow::Error::from),
                    Some(metrics.snapshot()),
                    Some(metrics.window_summary()),
                )
            }
            None => (Ok(()), None, None),
        };

        // 3. stop the router (in-flight forwards finish first)
        router_token.cancel();
        let (router_result, router_stats) = match router {
            Some(handle) => {
                let metrics = handle.metrics();
                let result = handle.join().await;
                (result.map_err(anyhow::Error::from), Some(metrics.snapshot()))
            }
            None => (Ok(()), None),
        };

        // 4. close every pooled producer
        pool.shutdown().await;

        let stats = PlatformStats {
            stop_reason: reason.to_string(),
            duration: start_time.elapsed(),
            ingest: ingest_stats,
            windows,
            router: router_stats,
            pool: pool.stats(),
            load: load_report,
        };

        info!(
            duration_secs = stats.duration.as_secs_f64(),
            rate = stats.ingest_rate(),
            "Data-plane shutdown complete"
        );

        ingest_result.context("Ingestion engine failed")?;
        router_result.context("Dataset router failed")?;
        if let StopReason::Unhealthy(reason) = reason {
            anyhow::bail!("Data-plane stopped unhealthy: {reason}");
        }
        Ok(stats)
    }

    /// Health loop; returns why the platform should stop
    async fn monitor(
        &self,
        stop: impl Future<Output = ()>,
        ingest: Option<&IngestionHandle>,
        router: Option<&RouterHandle>,
        mut load_task: Option<JoinHandle<LoadReport>>,
    ) -> (StopReason, Option<JoinHandle<LoadReport>>, Option<LoadReport>) {
        let timeout = self.options.timeout;
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(stop);
        tokio::pin!(deadline);

        let mut health = tokio::time::interval(self.options.health_interval.max(Duration::from_millis(10)));
        let mut load_report = None;

        let reason = loop {
            tokio::select! {
                _ = &mut stop => break StopReason::Signal,
                _ = &mut deadline => {
                    warn!(timeout_secs = timeout.map(|t| t.as_secs()), "Run timed out");
                    break StopReason::Timeout;
                }
                _ = health.tick() => {
                    if let Some(Err(e)) = ingest.map(IngestionHandle::check_health) {
                        error!(error = %e, "Ingestion engine unhealthy");
                        break StopReason::Unhealthy(e.to_string());
                    }
                    if let Some(Err(e)) = router.map(RouterHandle::check_health) {
                        error!(error = %e, "Dataset router unhealthy");
                        break StopReason::Unhealthy(e.to_string());
                    }

                    if load_task.as_ref().is_some_and(JoinHandle::is_finished) {
                        if let Some(task) = load_task.take() {
                            match task.await {
                                Ok(report) => load_report = Some(report),
                                Err(e) => {
                                    warn!(error = %e, "Synthetic load task failed");
                                    load_report = Some(LoadReport::default());
                                }
                            }
                        }
                    }
                    if let Some(report) = &load_report {
                        if self.drained(report, ingest, router) {
                            info!("Synthetic load fully processed");
                            break StopReason::Drained;
                        }
                    }
                }
            }
        };

        (reason, load_task, load_report)
    }

    /// Every published synthetic event has been acked by its consumer
    fn drained(
        &self,
        report: &LoadReport,
        ingest: Option<&IngestionHandle>,
        router: Option<&RouterHandle>,
    ) -> bool {
        let ingest_done = ingest.is_none_or(|handle| handle.stats().acked >= report.ingest_published);
        let router_done = router.is_none_or(|handle| {
            let stats = handle.stats();
            let mut settled = stats.outgoing + stats.stale + stats.malformed;
            if self.options.config.router.ack_policy == AckPolicy::Always {
                settled += stats.failed;
            }
            settled >= report.global_published
        });
        ingest_done && router_done
    }
}
