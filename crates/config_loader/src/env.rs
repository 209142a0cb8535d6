//! 环境变量覆盖
//!
//! 变量名为 `TELEMETRY_<FIELD_IN_UPPER_SNAKE>`，例如 `TELEMETRY_FLUSH_INTERVAL_MS`。
//! 列表类字段 (`TELEMETRY_SOURCE_TOPICS`) 以逗号分隔。

use std::fmt::Display;
use std::str::FromStr;

use contracts::{AckPolicy, ContractError, PlatformConfig};

/// Variable name prefix
pub const ENV_PREFIX: &str = "TELEMETRY_";

/// Apply overrides from the process environment
pub fn apply_env_overrides(config: &mut PlatformConfig) -> Result<(), ContractError> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

/// Apply overrides from `lookup` (variable name -> value)
pub fn apply_overrides<F>(config: &mut PlatformConfig, lookup: F) -> Result<(), ContractError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Overrides { lookup };

    env.set("INSTANCE_ID", &mut config.instance_id)?;

    env.set("DEFAULT_PARTITIONS", &mut config.broker.default_partitions)?;
    env.set("ACK_GROUP_TIME_MS", &mut config.broker.ack_group_time_ms)?;
    env.set("MAX_UNACKED_MESSAGES", &mut config.broker.max_unacked_messages)?;
    env.set("ACK_TIMEOUT_MS", &mut config.broker.ack_timeout_ms)?;

    env.set("PRODUCER_CACHE_MAX_SIZE", &mut config.producer_pool.max_size)?;
    env.set(
        "PRODUCER_CACHE_IDLE_TTL_SECS",
        &mut config.producer_pool.idle_ttl_secs,
    )?;

    let ingest = &mut config.ingest;
    env.set("INGEST_ENABLED", &mut ingest.enabled)?;
    env.set_list("SOURCE_TOPICS", &mut ingest.source_topics);
    env.set("INGEST_SUBSCRIPTION_NAME", &mut ingest.subscription_name)?;
    env.set("CONSUMER_COUNT", &mut ingest.consumer_count)?;
    env.set("FLUSH_INTERVAL_MS", &mut ingest.flush_interval_ms)?;
    env.set("MAX_WINDOW_SIZE", &mut ingest.max_window_size)?;
    env.set(
        "OVERFLOW_BUFFER_MULTIPLIER",
        &mut ingest.overflow_buffer_multiplier,
    )?;
    env.set("PERSIST_QUEUE_DEPTH", &mut ingest.persist_queue_depth)?;
    env.set("OVERFLOW_BACKOFF_MS", &mut ingest.overflow_backoff_ms)?;
    env.set("DLQ_TOPIC", &mut ingest.dlq_topic)?;

    let router = &mut config.router;
    env.set("ROUTER_ENABLED", &mut router.enabled)?;
    env.set("GLOBAL_TOPIC", &mut router.global_topic)?;
    env.set("ROUTER_SUBSCRIPTION_NAME", &mut router.subscription_name)?;
    env.set("DATASET_TOPIC_PREFIX", &mut router.dataset_topic_prefix)?;
    env.set(
        "STALENESS_THRESHOLD_MINUTES",
        &mut router.staleness_threshold_minutes,
    )?;
    env.set(
        "MAX_FANOUT_CONCURRENCY",
        &mut router.max_fanout_concurrency,
    )?;
    if let Some(value) = env.get("ACK_POLICY") {
        router.ack_policy = parse_ack_policy(&value)?;
    }

    Ok(())
}

fn parse_ack_policy(value: &str) -> Result<AckPolicy, ContractError> {
    match value.trim().to_lowercase().replace('-', "_").as_str() {
        "on_success" => Ok(AckPolicy::OnSuccess),
        "always" => Ok(AckPolicy::Always),
        other => Err(ContractError::config_validation(
            format!("{ENV_PREFIX}ACK_POLICY"),
            format!("expected 'on_success' or 'always', got '{other}'"),
        )),
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn get(&self, field: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{field}"))
    }

    fn set<T>(&self, field: &str, target: &mut T) -> Result<(), ContractError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(raw) = self.get(field) {
            *target = raw.trim().parse().map_err(|e: T::Err| {
                ContractError::config_validation(
                    format!("{ENV_PREFIX}{field}"),
                    format!("invalid value '{raw}': {e}"),
                )
            })?;
        }
        Ok(())
    }

    fn set_list(&self, field: &str, target: &mut Vec<String>) {
        if let Some(raw) = self.get(field) {
            *target = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}
