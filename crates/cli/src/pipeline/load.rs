//! Synthetic load generator
//!
//! 通过 producer pool 向 ingest source topics 与 router global topic 发布事件，
//! 用于本地运行和冒烟测试。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use contracts::{BrokerClient, Producer, ProducerKey, TelemetryEvent};
use producer_pool::ProducerPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const SENDER_NAME: &str = "synthetic-load";
const DATASETS: [&str; 4] = ["weather", "traffic", "air-quality", "energy"];

/// Synthetic load settings
#[derive(Debug, Clone)]
pub struct SyntheticLoadConfig {
    pub events: u64,
    /// Events per second (0 = unthrottled)
    pub rate: u64,
    /// Share of malformed payloads (0.0 - 1.0)
    pub malformed_ratio: f64,
}

/// Where the events go
#[derive(Debug, Clone, Default)]
pub struct LoadTargets {
    pub source_topics: Vec<String>,
    pub global_topic: Option<String>,
}

/// Confirmed publishes per destination
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadReport {
    pub ingest_published: u64,
    pub global_published: u64,
    pub malformed: u64,
    pub failed: u64,
}

/// Publish `config.events` events, one per target family
#[instrument(name = "synthetic_load", skip_all, fields(events = config.events, rate = config.rate))]
pub async fn run<B: BrokerClient>(
    config: SyntheticLoadConfig,
    targets: LoadTargets,
    pool: Arc<ProducerPool<B>>,
    shutdown: CancellationToken,
) -> LoadReport {
    let mut report = LoadReport::default();
    let mut ticker = (config.rate > 0).then(|| {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / config.rate as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        ticker
    });
    let malformed_every = malformed_period(config.malformed_ratio);

    for seq in 0..config.events {
        if shutdown.is_cancelled() {
            break;
        }
        if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        let malformed = malformed_every.is_some_and(|every| seq % every == every - 1);
        let content = if malformed {
            report.malformed += 1;
            Bytes::from(format!("{{\"event_id\": \"synthetic-{seq}\", \"value\": "))
        } else {
            match synthetic_event(seq).encode() {
                Ok(content) => content,
                Err(e) => {
                    warn!(seq, error = %e, "encode failed");
                    report.failed += 1;
                    continue;
                }
            }
        };

        if !targets.source_topics.is_empty() {
            let topic = &targets.source_topics[seq as usize % targets.source_topics.len()];
            if publish(&pool, topic, content.clone()).await {
                report.ingest_published += 1;
            } else {
                report.failed += 1;
            }
        }
        if let Some(topic) = &targets.global_topic {
            if publish(&pool, topic, content).await {
                report.global_published += 1;
            } else {
                report.failed += 1;
            }
        }
    }

    info!(
        ingest = report.ingest_published,
        global = report.global_published,
        malformed = report.malformed,
        failed = report.failed,
        "Synthetic load finished"
    );
    report
}

async fn publish<B: BrokerClient>(pool: &ProducerPool<B>, topic: &str, content: Bytes) -> bool {
    let key = ProducerKey::new(topic).with_sender_name(SENDER_NAME);
    let sent = match pool.get(&key).await {
        Ok(producer) => producer.send(content).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match sent {
        Ok(_) => true,
        Err(e) => {
            warn!(topic, error = %e, "synthetic publish failed");
            false
        }
    }
}

/// Every n-th event is malformed, `None` when the ratio is zero
fn malformed_period(ratio: f64) -> Option<u64> {
    if ratio.is_nan() || ratio <= 0.0 {
        return None;
    }
    Some((1.0 / ratio.min(1.0)).round().max(1.0) as u64)
}

fn synthetic_event(seq: u64) -> TelemetryEvent {
    let dataset = DATASETS[seq as usize % DATASETS.len()];
    let mut tags = BTreeMap::new();
    tags.insert("origin".to_string(), SENDER_NAME.to_string());

    TelemetryEvent {
        event_id: format!("synthetic-{seq}"),
        dataset_id: dataset.to_string(),
        source: format!("sensor-{}", seq % 16),
        metric: "reading".to_string(),
        value: (seq % 1000) as f64 / 10.0,
        timestamp: Utc::now(),
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_period() {
        assert_eq!(malformed_period(0.0), None);
        assert_eq!(malformed_period(f64::NAN), None);
        assert_eq!(malformed_period(0.01), Some(100));
        assert_eq!(malformed_period(1.0), Some(1));
        assert_eq!(malformed_period(5.0), Some(1));
    }

    #[test]
    fn test_synthetic_event_round_trips() {
        let event = synthetic_event(5);
        let decoded = TelemetryEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.event_id, "synthetic-5");
        assert_eq!(decoded.dataset_id, "traffic");
    }
}
