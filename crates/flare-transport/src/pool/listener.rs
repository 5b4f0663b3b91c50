use crate::connection::ConnectionInfo;

/// 连接被关闭的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// 空闲时间超过 `max_idle_time`。
    IdleTimeout,
    /// 连接在空闲或归还时已不可用（对端关闭、探测失败、不可复用）。
    UnexpectedClose,
    /// 路由空闲池已满。
    PoolFull,
    /// 调用方主动驱逐。
    Evicted,
    /// 交换失败导致驱逐。
    Errored,
    /// 连接池关闭。
    PoolShutdown,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::UnexpectedClose => "unexpected_close",
            Self::PoolFull => "pool_full",
            Self::Evicted => "evicted",
            Self::Errored => "errored",
            Self::PoolShutdown => "pool_shutdown",
        }
    }
}

/// 连接生命周期回调，全部默认为空操作。
///
/// 回调在连接池的调用线程上同步执行，实现方应保持轻量，不得阻塞。
pub trait PoolListener: Send + Sync + 'static {
    fn on_connected(&self, _info: &ConnectionInfo) {}

    fn on_acquire(&self, _info: &ConnectionInfo, _reused: bool) {}

    fn on_return(&self, _info: &ConnectionInfo) {}

    fn on_closed(&self, _info: &ConnectionInfo, _reason: CloseReason) {}
}
