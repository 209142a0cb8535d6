//! Count/time bounded windowing.
//!
//! 窗口在第一条消息到达时开始计时；达到 `max_window_size` 或
//! `flush_interval` 到期 (先到者) 即 flush。空窗口不 flush。

use std::time::Duration;

use async_channel::Receiver;
use contracts::Message;
use observability::FlushTrigger;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Message admitted into the ingress buffer, tagged with its consumer handle
#[derive(Debug, Clone)]
pub struct Admitted {
    /// Index of the consumer handle that received the message
    pub handle: usize,
    pub message: Message,
}

/// Window handed to the persistence stage
#[derive(Debug)]
pub struct FlushedWindow {
    pub seq: u64,
    pub trigger: FlushTrigger,
    pub entries: Vec<Admitted>,
}

/// Window under accumulation
#[derive(Debug)]
pub struct Window {
    entries: Vec<Admitted>,
    started: Option<Instant>,
}

impl Window {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            started: None,
        }
    }

    pub fn push(&mut self, item: Admitted) {
        if self.entries.is_empty() {
            self.started = Some(Instant::now());
        }
        self.entries.push(item);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time-trigger deadline, `None` while empty
    pub fn deadline(&self, flush_interval: Duration) -> Option<Instant> {
        self.started.map(|started| started + flush_interval)
    }

    /// Take the accumulated entries, starting a fresh window
    pub fn take(&mut self) -> Vec<Admitted> {
        self.started = None;
        let capacity = self.entries.capacity();
        std::mem::replace(&mut self.entries, Vec::with_capacity(capacity))
    }
}

/// Windowing task
///
/// Returns when the ingress channel is closed and drained (the partial window
/// is flushed first) or when the persistence stage has gone away.
#[instrument(
    name = "ingest_window_loop",
    skip_all,
    fields(max_window_size = max_window_size, flush_interval_ms = flush_interval.as_millis() as u64)
)]
pub async fn run_windowing(
    ingress: Receiver<Admitted>,
    persist: mpsc::Sender<FlushedWindow>,
    max_window_size: usize,
    flush_interval: Duration,
) {
    let max_window_size = max_window_size.max(1);
    let mut window = Window::with_capacity(max_window_size);
    let mut seq: u64 = 0;

    loop {
        let next = match window.deadline(flush_interval) {
            Some(deadline) => tokio::select! {
                item = ingress.recv() => Some(item),
                _ = tokio::time::sleep_until(deadline) => None,
            },
            None => Some(ingress.recv().await),
        };

        let trigger = match next {
            Some(Ok(item)) => {
                window.push(item);
                if window.len() < max_window_size {
                    continue;
                }
                FlushTrigger::Count
            }
            Some(Err(_)) => {
                // 所有 receive loop 已退出，冲刷剩余窗口
                if !window.is_empty() {
                    flush(&persist, &mut window, &mut seq, FlushTrigger::Shutdown).await;
                }
                debug!(windows = seq, "ingress closed, windowing stopped");
                return;
            }
            None => FlushTrigger::Time,
        };

        if !flush(&persist, &mut window, &mut seq, trigger).await {
            debug!("persistence stage gone, windowing stopped");
            return;
        }
        observability::record_ingress_depth(ingress.len());
    }
}

async fn flush(
    persist: &mpsc::Sender<FlushedWindow>,
    window: &mut Window,
    seq: &mut u64,
    trigger: FlushTrigger,
) -> bool {
    let entries = window.take();
    trace!(seq = *seq, size = entries.len(), trigger = trigger.as_str(), "window flushed");
    observability::record_window_flushed(entries.len(), trigger);

    let flushed = FlushedWindow {
        seq: *seq,
        trigger,
        entries,
    };
    *seq += 1;
    // 持久化队列满时在此等待，ingress 随之积压
    persist.send(flushed).await.is_ok()
}
