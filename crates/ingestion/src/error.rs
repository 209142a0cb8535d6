//! Ingestion 错误类型

use contracts::StorageError;
use subscription::SubscribeError;
use thiserror::Error;

/// Ingestion 错误
#[derive(Debug, Error)]
pub enum IngestError {
    /// 订阅失败 (启动时致命)
    #[error("failed to subscribe source topics")]
    Subscribe(#[from] SubscribeError),

    /// 存储层批量级失败，组件无法继续
    #[error("storage failure is fatal for the ingestion engine")]
    StorageFatal(#[source] StorageError),

    /// 内部任务异常退出
    #[error("ingestion task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },

    /// 引擎已停止
    #[error("ingestion engine unhealthy: {reason}")]
    Unhealthy { reason: String },

    /// 配置无效
    #[error("invalid ingestion config: {message}")]
    InvalidConfig { message: String },
}

impl IngestError {
    pub fn task_failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            message: message.into(),
        }
    }
}

/// Ingestion Result 类型别名
pub type Result<T> = std::result::Result<T, IngestError>;
