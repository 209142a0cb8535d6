//! 配置校验模块
//!
//! 校验规则：
//! - instance_id 非空
//! - 数量类参数 > 0 (窗口大小、并发度、容量 ...)
//! - topic / subscription 名称非空
//! - dlq_topic 不能是 source topic (否则失败记录会被重新消费)
//!
//! 关闭的组件 (`enabled = false`) 不校验。

use std::collections::HashSet;

use contracts::{
    BrokerConfig, ContractError, IngestConfig, PlatformConfig, ProducerPoolConfig, RouterConfig,
};

/// 校验 PlatformConfig 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(config: &PlatformConfig) -> Result<(), ContractError> {
    require_non_empty("instance_id", &config.instance_id)?;
    validate_broker(&config.broker)?;
    validate_producer_pool(&config.producer_pool)?;
    if config.ingest.enabled {
        validate_ingest(&config.ingest)?;
    }
    if config.router.enabled {
        validate_router(&config.router)?;
    }
    Ok(())
}

fn validate_broker(broker: &BrokerConfig) -> Result<(), ContractError> {
    require_positive("broker.default_partitions", broker.default_partitions as u64)
}

fn validate_producer_pool(pool: &ProducerPoolConfig) -> Result<(), ContractError> {
    require_positive("producer_pool.max_size", pool.max_size)?;
    require_positive("producer_pool.idle_ttl_secs", pool.idle_ttl_secs)
}

/// 校验 ingest 配置
fn validate_ingest(ingest: &IngestConfig) -> Result<(), ContractError> {
    if ingest.source_topics.is_empty() {
        return Err(ContractError::config_validation(
            "ingest.source_topics",
            "at least one source topic is required",
        ));
    }

    let mut seen = HashSet::new();
    for (idx, topic) in ingest.source_topics.iter().enumerate() {
        require_non_empty(&format!("ingest.source_topics[{idx}]"), topic)?;
        if !seen.insert(topic.as_str()) {
            return Err(ContractError::config_validation(
                format!("ingest.source_topics[{idx}]"),
                format!("duplicate source topic '{topic}'"),
            ));
        }
    }

    require_non_empty("ingest.subscription_name", &ingest.subscription_name)?;
    require_non_empty("ingest.dlq_topic", &ingest.dlq_topic)?;
    if seen.contains(ingest.dlq_topic.as_str()) {
        return Err(ContractError::config_validation(
            "ingest.dlq_topic",
            format!("dlq_topic '{}' is also a source topic", ingest.dlq_topic),
        ));
    }

    require_positive("ingest.consumer_count", ingest.consumer_count as u64)?;
    require_positive("ingest.flush_interval_ms", ingest.flush_interval_ms)?;
    require_positive("ingest.max_window_size", ingest.max_window_size as u64)?;
    require_positive(
        "ingest.overflow_buffer_multiplier",
        ingest.overflow_buffer_multiplier as u64,
    )?;
    require_positive("ingest.persist_queue_depth", ingest.persist_queue_depth as u64)
}

/// staleness 上限：一年
const MAX_STALENESS_MINUTES: u64 = 365 * 24 * 60;

/// 校验 router 配置
fn validate_router(router: &RouterConfig) -> Result<(), ContractError> {
    require_non_empty("router.global_topic", &router.global_topic)?;
    require_non_empty("router.subscription_name", &router.subscription_name)?;
    require_non_empty("router.dataset_topic_prefix", &router.dataset_topic_prefix)?;
    require_positive(
        "router.staleness_threshold_minutes",
        router.staleness_threshold_minutes,
    )?;
    if router.staleness_threshold_minutes > MAX_STALENESS_MINUTES {
        return Err(ContractError::config_validation(
            "router.staleness_threshold_minutes",
            format!("must be <= {MAX_STALENESS_MINUTES} (one year)"),
        ));
    }
    require_positive(
        "router.max_fanout_concurrency",
        router.max_fanout_concurrency as u64,
    )
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ContractError> {
    if value.trim().is_empty() {
        return Err(ContractError::config_validation(field, "cannot be empty"));
    }
    Ok(())
}

fn require_positive(field: &str, value: u64) -> Result<(), ContractError> {
    if value == 0 {
        return Err(ContractError::config_validation(field, "must be > 0"));
    }
    Ok(())
}
