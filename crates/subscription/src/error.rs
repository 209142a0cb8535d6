use contracts::ContractError;
use thiserror::Error;

/// Subscription Manager 错误
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// 参数无效 (空 topic 列表 / 空名称)
    #[error("invalid subscription '{name}': {message}")]
    Invalid { name: String, message: String },

    /// broker 拒绝订阅
    #[error("broker rejected subscription '{name}'")]
    Broker {
        name: String,
        #[source]
        source: ContractError,
    },
}

pub type Result<T> = std::result::Result<T, SubscribeError>;
