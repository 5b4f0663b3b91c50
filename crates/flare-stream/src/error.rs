use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// 消息体读取、订阅与背压桥共用的错误类型。
///
/// # 契约（What）
/// - `AlreadyConsumed`：单次消费的消息体被第二次读取，或已取消的桥被再次订阅；
/// - `AlreadySubscribed`：桥上已有活跃订阅者时再次 `subscribe`；
/// - `InvalidDemand`：`request(n)` 传入 `n ≤ 0`；
/// - `Upstream`：生产方（通常是传输层）报告的失败，原始错误保存在 `source` 中。
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("body has already been consumed")]
    AlreadyConsumed,
    #[error("a subscriber is already attached to this body")]
    AlreadySubscribed,
    #[error("demand must be positive, got {requested}")]
    InvalidDemand { requested: i64 },
    #[error("body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("body is not valid UTF-8")]
    InvalidUtf8 {
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("upstream body source failed: {source}")]
    Upstream {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("body stream was cancelled")]
    Cancelled,
    #[error("body producer went away before the body was complete")]
    ProducerGone,
}

impl StreamError {
    /// 把任意生产方错误包装为 `Upstream`。
    pub fn upstream<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Upstream {
            source: error.into(),
        }
    }

    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }
}
