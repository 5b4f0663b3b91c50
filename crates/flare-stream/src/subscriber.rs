use crate::bridge::Shared;
use crate::error::StreamError;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// 拉取协议中的消费方。
///
/// 所有回调都在桥的驱动任务上串行执行，同一订阅者不会并发收到两次回调。
/// 回调内部可以直接调用 [`Subscription::request`] / [`Subscription::cancel`]，
/// 新的需求会在当前回调返回后被驱动任务吸收。
pub trait Subscriber: Send + 'static {
    fn on_subscribe(&mut self, subscription: Subscription);

    fn on_next(&mut self, chunk: Bytes);

    fn on_error(&mut self, error: StreamError);

    fn on_complete(&mut self);
}

/// 订阅者手中的需求 / 取消句柄。
///
/// # 契约（What）
/// - `request(n)`：`n ≤ 0` 立即返回 [`StreamError::InvalidDemand`]，同时订阅者会经
///   `on_error` 收到同一错误，随后桥进入取消路径；`n > 0` 时饱和累加需求；
/// - `cancel()`：幂等；调用后不再向该订阅者投递任何信号。
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn request(&self, n: i64) -> Result<(), StreamError> {
        if n <= 0 {
            self.shared.reject_demand(n);
            return Err(StreamError::InvalidDemand { requested: n });
        }
        self.shared.add_demand(n.unsigned_abs());
        Ok(())
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
