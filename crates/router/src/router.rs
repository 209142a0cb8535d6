//! DatasetRouter - ordered consumption of the global topic, fan-out to dataset topics

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use contracts::{
    AckPolicy, BrokerClient, ContentType, Consumer, ContractError, Message, MessageId, Producer,
    ProducerKey, RouterConfig, SubscriptionMode, TelemetryEvent,
};
use parking_lot::Mutex;
use producer_pool::ProducerPool;
use subscription::SubscriptionManager;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, RouterError};
use crate::metrics::{RouterMetrics, RouterStats};

/// Pause after a transient receive error
const RECEIVE_BACKOFF: Duration = Duration::from_millis(100);

/// Chain table size at which completed chains are pruned
const CHAIN_PRUNE_THRESHOLD: usize = 1024;

/// Dataset Router
pub struct DatasetRouter<B: BrokerClient> {
    config: RouterConfig,
    subscriptions: Arc<SubscriptionManager<B>>,
    pool: Arc<ProducerPool<B>>,
    metrics: Arc<RouterMetrics>,
}

impl<B: BrokerClient> DatasetRouter<B> {
    pub fn new(
        config: RouterConfig,
        subscriptions: Arc<SubscriptionManager<B>>,
        pool: Arc<ProducerPool<B>>,
    ) -> Self {
        Self {
            config,
            subscriptions,
            pool,
            metrics: Arc::new(RouterMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<RouterMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribe the global topic and start routing
    ///
    /// # Errors
    /// Subscription failure, or an unusable configuration.
    #[instrument(
        name = "router_spawn",
        skip_all,
        fields(topic = %self.config.global_topic, policy = ?self.config.ack_policy)
    )]
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<RouterHandle> {
        if self.config.max_fanout_concurrency == 0 {
            return Err(RouterError::InvalidConfig {
                message: "max_fanout_concurrency must be > 0".to_string(),
            });
        }
        if self.config.dataset_topic_prefix.is_empty() {
            return Err(RouterError::InvalidConfig {
                message: "dataset_topic_prefix is empty".to_string(),
            });
        }

        let consumer = self
            .subscriptions
            .subscribe(
                std::slice::from_ref(&self.config.global_topic),
                &self.config.subscription_name,
                ContentType::Json,
                SubscriptionMode::Ordered,
            )
            .await?;

        let token = shutdown.child_token();
        let failure = Arc::new(OnceLock::new());
        let worker = Arc::new(RouteWorker::<B> {
            config: self.config,
            pool: self.pool,
            consumer,
            metrics: Arc::clone(&self.metrics),
            held: Mutex::new(HashMap::new()),
        });

        let task = {
            let token = token.clone();
            let failure = Arc::clone(&failure);
            tokio::spawn(async move {
                let result = worker.run(token).await;
                if let Err(e) = &result {
                    let _ = failure.set(e.to_string());
                }
                result
            })
        };

        Ok(RouterHandle {
            token,
            task,
            metrics: self.metrics,
            failure,
        })
    }
}

/// Handle to a running router
pub struct RouterHandle {
    token: CancellationToken,
    task: JoinHandle<Result<()>>,
    metrics: Arc<RouterMetrics>,
    failure: Arc<OnceLock<String>>,
}

impl RouterHandle {
    /// `Err` once the router stopped on its own
    pub fn check_health(&self) -> Result<()> {
        if let Some(reason) = self.failure.get() {
            return Err(RouterError::Unhealthy {
                reason: reason.clone(),
            });
        }
        if self.task.is_finished() && !self.token.is_cancelled() {
            return Err(RouterError::Unhealthy {
                reason: "router stopped unexpectedly".to_string(),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> RouterStats {
        self.metrics.snapshot()
    }

    /// Shared counters, still readable after [`join`](Self::join)
    pub fn metrics(&self) -> Arc<RouterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for in-flight forwards to finish and the consumer to close
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| RouterError::task_failed("router", e.to_string()))?
    }
}

struct RouteWorker<B: BrokerClient> {
    config: RouterConfig,
    pool: Arc<ProducerPool<B>>,
    consumer: Arc<B::Consumer>,
    metrics: Arc<RouterMetrics>,
    /// destination topic -> nacked messages that must publish before anything newer
    held: Mutex<HashMap<String, BTreeSet<MessageId>>>,
}

impl<B: BrokerClient> RouteWorker<B> {
    #[instrument(name = "router_run", skip_all, fields(subscription = %self.config.subscription_name))]
    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            max_fanout = self.config.max_fanout_concurrency,
            staleness_minutes = self.config.staleness_threshold_minutes,
            "Router started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_fanout_concurrency));
        // destination topic -> completion of the last send queued for it
        let mut chains: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        let mut tasks = JoinSet::new();

        let result = loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                received = self.consumer.receive() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(ContractError::Closed { .. }) => {
                    break Err(RouterError::ConsumerClosed {
                        subscription: self.consumer.subscription().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => continue,
                    }
                }
            };

            self.metrics.inc_incoming();
            observability::record_message_received("router");

            let Some(event) = self.screen(&message).await else {
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            if chains.len() >= CHAIN_PRUNE_THRESHOLD {
                chains.retain(|_, done| matches!(done.try_recv(), Err(TryRecvError::Empty)));
            }

            let topic = self.config.dataset_topic(&event.dataset_id);
            let (done_tx, done_rx) = oneshot::channel();
            let previous = chains.insert(topic.clone(), done_rx);

            let worker = Arc::clone(&self);
            tasks.spawn(async move {
                worker
                    .forward(message, event.dataset_id, topic, previous, done_tx, permit)
                    .await;
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "forward task panicked");
                }
            }
        };

        // in-flight forwards finish (and ack) before the consumer closes
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "forward task panicked");
            }
        }
        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "consumer close failed");
        }

        let stats = self.metrics.snapshot();
        info!(
            incoming = stats.incoming,
            outgoing = stats.outgoing,
            stale = stats.stale,
            failed = stats.failed,
            malformed = stats.malformed,
            "Router stopped"
        );
        result
    }

    /// Decode, record checks and staleness; rejected messages are acked here
    async fn screen(&self, message: &Message) -> Option<TelemetryEvent> {
        let event = match TelemetryEvent::decode(&message.content)
            .map_err(|e| e.to_string())
            .and_then(|event| event.validate().map(|()| event))
        {
            Ok(event) => event,
            Err(e) => {
                debug!(id = %message.id, error = %e, "malformed event");
                self.metrics.inc_malformed();
                observability::record_router_outcome("malformed", None);
                self.ack(&message.id).await;
                return None;
            }
        };

        let lower_bound = self.config.staleness_lower_bound(Utc::now());
        if lower_bound.is_some_and(|bound| event.timestamp < bound) {
            debug!(id = %message.id, timestamp = %event.timestamp, "stale event dropped");
            self.metrics.inc_stale();
            observability::record_router_outcome("stale", Some(&event.dataset_id));
            self.ack(&message.id).await;
            return None;
        }

        Some(event)
    }

    /// resolve producer -> send -> ack
    #[instrument(
        name = "router_forward",
        skip(self, message, previous, done, _permit),
        fields(id = %message.id)
    )]
    async fn forward(
        &self,
        message: Message,
        dataset_id: String,
        topic: String,
        previous: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
        _permit: OwnedSemaphorePermit,
    ) {
        observability::record_router_inflight(self.metrics.enter());

        // 同一 dataset topic 的前一条发送完成后才发送
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        if !self.may_publish(&topic, &message.id) {
            // an earlier message for this topic is waiting for redelivery
            self.hold(&topic, &message.id);
            let _ = done.send(());
            debug!(topic = %topic, "held behind a failed publish");
            self.nack(&message.id).await;
            observability::record_router_inflight(self.metrics.exit());
            return;
        }

        let key = ProducerKey::new(&topic).with_content_type(ContentType::Json);
        let published = match self.pool.get(&key).await {
            Ok(producer) => producer
                .send(message.content.clone())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match &published {
            Ok(()) => self.release(&topic, &message.id),
            Err(_) if self.config.ack_policy == AckPolicy::OnSuccess => {
                self.hold(&topic, &message.id)
            }
            Err(_) => {}
        }
        let _ = done.send(());

        match published {
            Ok(()) => {
                self.metrics.inc_outgoing();
                observability::record_router_outcome("forwarded", Some(&dataset_id));
                self.ack(&message.id).await;
            }
            Err(e) => {
                self.metrics.inc_failed();
                observability::record_router_outcome("failed", Some(&dataset_id));
                warn!(error = %e, policy = ?self.config.ack_policy, "publish failed");
                match self.config.ack_policy {
                    AckPolicy::OnSuccess => self.nack(&message.id).await,
                    AckPolicy::Always => self.ack(&message.id).await,
                }
            }
        }

        observability::record_router_inflight(self.metrics.exit());
    }

    /// Nothing held for the topic, or `id` is the oldest held message
    fn may_publish(&self, topic: &str, id: &MessageId) -> bool {
        self.held
            .lock()
            .get(topic)
            .and_then(BTreeSet::first)
            .map_or(true, |first| first == id)
    }

    fn hold(&self, topic: &str, id: &MessageId) {
        self.held
            .lock()
            .entry(topic.to_string())
            .or_default()
            .insert(id.clone());
    }

    fn release(&self, topic: &str, id: &MessageId) {
        let mut held = self.held.lock();
        if let Some(ids) = held.get_mut(topic) {
            ids.remove(id);
            if ids.is_empty() {
                held.remove(topic);
            }
        }
    }

    async fn nack(&self, id: &MessageId) {
        if let Err(e) = self.consumer.negative_acknowledge(id).await {
            warn!(id = %id, error = %e, "negative acknowledge failed");
        }
    }

    async fn ack(&self, id: &MessageId) {
        if let Err(e) = self.consumer.acknowledge(id).await {
            self.metrics.inc_ack_failures();
            observability::record_ack_failure("router", 1);
            warn!(id = %id, error = %e, "acknowledge failed");
        }
    }
}
