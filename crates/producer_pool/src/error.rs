//! Producer Pool 错误类型

use std::sync::Arc;

use contracts::ContractError;
use thiserror::Error;

/// Producer Pool 错误
///
/// `Clone` so that every caller collapsed into one creation receives the same error.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// broker 拒绝创建 producer
    #[error("producer creation failed for topic '{topic}': {source}")]
    Creation {
        topic: String,
        #[source]
        source: Arc<ContractError>,
    },

    /// 池已关闭
    #[error("producer pool is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, PoolError>;
