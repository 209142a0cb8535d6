//! 数据面指标收集模块
//!
//! Named `telemetry_plane_*` recorders plus an in-memory window aggregator.

use metrics::{counter, gauge, histogram};

/// 窗口 flush 触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// 达到 max_window_size
    Count,
    /// flush_interval 到期
    Time,
    /// 关闭时冲刷剩余窗口
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Count => "count",
            FlushTrigger::Time => "time",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// 记录消息接收
pub fn record_message_received(component: &'static str) {
    counter!("telemetry_plane_messages_received_total", "component" => component).increment(1);
}

/// 记录 ingress 缓冲区溢出
pub fn record_ingress_overflow() {
    counter!("telemetry_plane_ingress_overflow_total").increment(1);
}

/// 记录 ingress 缓冲区深度
pub fn record_ingress_depth(depth: usize) {
    gauge!("telemetry_plane_ingress_depth").set(depth as f64);
}

/// 记录窗口 flush
///
/// # Example
///
/// ```ignore
/// use observability::metrics::{record_window_flushed, FlushTrigger};
///
/// record_window_flushed(window.len(), FlushTrigger::Count);
/// ```
pub fn record_window_flushed(size: usize, trigger: FlushTrigger) {
    counter!("telemetry_plane_windows_flushed_total", "trigger" => trigger.as_str()).increment(1);
    histogram!("telemetry_plane_window_size").record(size as f64);
}

/// 记录持久化结果
pub fn record_window_persisted(persisted: usize, failed: usize, latency_ms: f64) {
    counter!("telemetry_plane_records_persisted_total").increment(persisted as u64);
    if failed > 0 {
        counter!("telemetry_plane_records_failed_total").increment(failed as u64);
    }
    histogram!("telemetry_plane_persist_latency_ms").record(latency_ms);
}

/// 记录 DLQ 转发
pub fn record_dlq_publish(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("telemetry_plane_dlq_published_total", "status" => status).increment(1);
}

/// 记录 ack 失败
pub fn record_ack_failure(component: &'static str, count: usize) {
    counter!("telemetry_plane_ack_failures_total", "component" => component)
        .increment(count as u64);
}

/// 记录 router 处理结果 (forwarded / stale / failed / malformed)
pub fn record_router_outcome(outcome: &'static str, dataset_id: Option<&str>) {
    match dataset_id {
        Some(dataset) => counter!(
            "telemetry_plane_router_events_total",
            "outcome" => outcome,
            "dataset" => dataset.to_string()
        )
        .increment(1),
        None => counter!("telemetry_plane_router_events_total", "outcome" => outcome).increment(1),
    }
}

/// 记录 router 在途数量
pub fn record_router_inflight(inflight: usize) {
    gauge!("telemetry_plane_router_inflight").set(inflight as f64);
}

/// 记录 producer pool 事件 (created / evicted / closed / close_failed)
pub fn record_pool_event(event: &'static str) {
    counter!("telemetry_plane_producer_pool_events_total", "event" => event).increment(1);
}

/// 记录 producer pool 大小
pub fn record_pool_size(size: u64) {
    gauge!("telemetry_plane_producer_pool_size").set(size as f64);
}

/// 窗口指标聚合器
///
/// 在内存中聚合每个窗口的指标，便于退出时输出摘要。
#[derive(Debug, Clone, Default)]
pub struct WindowMetricsAggregator {
    /// 总窗口数
    pub total_windows: u64,

    /// 按数量触发的窗口数
    pub count_triggered: u64,

    /// 按时间触发的窗口数
    pub time_triggered: u64,

    /// 持久化成功记录数
    pub total_persisted: u64,

    /// 转发 DLQ 记录数
    pub total_dlq: u64,

    /// 窗口大小统计
    pub window_stats: RunningStats,

    /// 持久化延迟统计 (毫秒)
    pub latency_stats: RunningStats,
}

impl WindowMetricsAggregator {
    /// 创建新的聚合器
    pub fn new() -> Self {
        Self::default()
    }

    /// 更新聚合统计
    pub fn update(
        &mut self,
        size: usize,
        trigger: FlushTrigger,
        persisted: usize,
        dlq: usize,
        latency_ms: f64,
    ) {
        self.total_windows += 1;
        match trigger {
            FlushTrigger::Count => self.count_triggered += 1,
            FlushTrigger::Time => self.time_triggered += 1,
            FlushTrigger::Shutdown => {}
        }
        self.total_persisted += persisted as u64;
        self.total_dlq += dlq as u64;
        self.window_stats.push(size as f64);
        self.latency_stats.push(latency_ms);
    }

    /// 生成摘要报告
    pub fn summary(&self) -> MetricsSummary {
        let total = self.total_persisted + self.total_dlq;
        MetricsSummary {
            total_windows: self.total_windows,
            count_triggered: self.count_triggered,
            time_triggered: self.time_triggered,
            total_persisted: self.total_persisted,
            total_dlq: self.total_dlq,
            dlq_rate: if total > 0 {
                self.total_dlq as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            window_size: StatsSummary::from(&self.window_stats),
            persist_latency_ms: StatsSummary::from(&self.latency_stats),
        }
    }
}

/// 指标摘要
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub total_windows: u64,
    pub count_triggered: u64,
    pub time_triggered: u64,
    pub total_persisted: u64,
    pub total_dlq: u64,
    pub dlq_rate: f64,
    pub window_size: StatsSummary,
    pub persist_latency_ms: StatsSummary,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Ingest Window Summary ===")?;
        writeln!(
            f,
            "Windows: {} (count-triggered {}, time-triggered {})",
            self.total_windows, self.count_triggered, self.time_triggered
        )?;
        writeln!(f, "Persisted records: {}", self.total_persisted)?;
        writeln!(f, "DLQ records: {} ({:.2}%)", self.total_dlq, self.dlq_rate)?;
        writeln!(f, "Window size: {}", self.window_size)?;
        writeln!(f, "Persist latency (ms): {}", self.persist_latency_ms)?;
        Ok(())
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    /// 样本数量
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 均值
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// 标准差
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
