//! HTTP/1.1 按路由划分的空闲连接池。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每条路由一个 LIFO 空闲列表：最近归还的连接最可能仍然存活，也最可能仍在
//!   中间设备的 NAT/负载均衡表项中；
//! - 规则只依赖 [`PooledConnection`]，便于用假连接验证。
//!
//! ## 逻辑（How）
//! - 路由表是分片并发映射（`DashMap`），每条路由的空闲列表各自由一把锁保护；
//! - 锁顺序固定为“路由锁 → 映射分片”：清理时在持有路由锁的情况下以 `Arc::ptr_eq`
//!   条件删除映射项；其余路径取出 `Arc` 后立即释放分片，再获取路由锁；
//! - 被删除的路由池置位 `retired`，此后不会再被写入，与删除竞争的 `release` 会重新取池。
//!
//! ## 契约（What）
//! - `try_acquire` 永不返回空闲超过 `max_idle_time` 的连接，被淘汰的连接随即关闭；
//! - 空闲超过 [`VALIDATION_THRESHOLD`] 的连接在交出前做一次存活探测；
//! - `release` 拒收的连接连同 [`RejectReason`] 交还调用方；给出的上限与已建路由池不符时
//!   记为 `SizeMismatch`，不与列表已满混淆。

use super::listener::CloseReason;
use crate::connection::{ConnectionId, PooledConnection};
use crate::error::PoolError;
use crate::route::Route;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// 空闲超过该时长的连接在复用前需要探测。
pub const VALIDATION_THRESHOLD: Duration = Duration::from_secs(1);

/// `release` 拒绝入池的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    NotAlive,
    PoolClosing,
    PoolFull,
    /// 路由池已按另一个上限创建，本次归还给出的上限与之不符。
    SizeMismatch,
}

impl RejectReason {
    pub const fn close_reason(self) -> CloseReason {
        match self {
            Self::NotAlive => CloseReason::UnexpectedClose,
            Self::PoolClosing => CloseReason::PoolShutdown,
            Self::PoolFull => CloseReason::PoolFull,
            Self::SizeMismatch => CloseReason::Evicted,
        }
    }
}

/// 被拒绝的连接连同原因一起交还调用方，由调用方负责关闭。
pub struct Rejected<C> {
    pub connection: C,
    pub reason: RejectReason,
}

impl<C> fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// 一次空闲清理的结果。
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub evicted: usize,
    pub errors: Vec<io::Error>,
}

struct IdleEntry<C> {
    connection: C,
    released_at: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleEntry<C>>,
    retired: bool,
}

struct RoutePool<C> {
    max_connections: usize,
    state: Mutex<PoolState<C>>,
}

impl<C> RoutePool<C> {
    fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                retired: false,
            }),
        }
    }
}

/// 按路由管理空闲连接的集合。
pub struct RoutePools<C> {
    pools: DashMap<Route, Arc<RoutePool<C>>>,
    max_idle_time: Duration,
}

impl<C: PooledConnection> RoutePools<C> {
    pub fn new(max_idle_time: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            max_idle_time,
        }
    }

    pub fn max_idle_time(&self) -> Duration {
        self.max_idle_time
    }

    /// 惰性创建路由池；同一路由以不同上限再次创建会失败。
    pub fn get_or_create_pool(&self, route: &Route, max_connections: usize) -> Result<(), PoolError> {
        self.pool_for(route, max_connections).map(|_| ())
    }

    fn pool_for(&self, route: &Route, max_connections: usize) -> Result<Arc<RoutePool<C>>, PoolError> {
        let pool = Arc::clone(
            self.pools
                .entry(route.clone())
                .or_insert_with(|| Arc::new(RoutePool::new(max_connections)))
                .value(),
        );
        if pool.max_connections != max_connections {
            return Err(PoolError::SizeMismatch {
                route: route.to_string(),
                existing: pool.max_connections,
                requested: max_connections,
            });
        }
        Ok(pool)
    }

    fn existing_pool(
        &self,
        route: &Route,
        max_connections: usize,
    ) -> Result<Option<Arc<RoutePool<C>>>, PoolError> {
        let Some(pool) = self.pools.get(route).map(|entry| Arc::clone(entry.value())) else {
            return Ok(None);
        };
        if pool.max_connections != max_connections {
            return Err(PoolError::SizeMismatch {
                route: route.to_string(),
                existing: pool.max_connections,
                requested: max_connections,
            });
        }
        Ok(Some(pool))
    }

    pub fn try_acquire(&self, route: &Route, max_connections: usize) -> Result<Option<C>, PoolError> {
        self.try_acquire_with(route, max_connections, |_, _| {})
    }

    /// 取出最近归还的可用连接；每个被淘汰的候选连接都会先关闭，再交给 `on_evict`。
    pub fn try_acquire_with<F>(
        &self,
        route: &Route,
        max_connections: usize,
        mut on_evict: F,
    ) -> Result<Option<C>, PoolError>
    where
        F: FnMut(&C, CloseReason),
    {
        let Some(pool) = self.existing_pool(route, max_connections)? else {
            return Ok(None);
        };
        loop {
            let candidate = pool.state.lock().idle.pop_front();
            let Some(entry) = candidate else {
                return Ok(None);
            };
            let idle_for = entry.released_at.elapsed();
            let mut connection = entry.connection;
            let reason = if idle_for > self.max_idle_time {
                Some(CloseReason::IdleTimeout)
            } else if idle_for > VALIDATION_THRESHOLD && !connection.probe() {
                Some(CloseReason::UnexpectedClose)
            } else if !connection.is_alive() {
                Some(CloseReason::UnexpectedClose)
            } else {
                None
            };
            let Some(reason) = reason else {
                trace!(route = %route, connection_id = %connection.id(), ?idle_for, "reusing idle connection");
                return Ok(Some(connection));
            };
            debug!(
                route = %route,
                connection_id = %connection.id(),
                reason = reason.as_str(),
                "discarding idle connection"
            );
            if let Err(error) = connection.close() {
                debug!(connection_id = %connection.id(), %error, "error closing discarded connection");
            }
            on_evict(&connection, reason);
        }
    }

    /// 把连接放回路由池的队首。
    pub fn release(
        &self,
        route: &Route,
        max_connections: usize,
        connection: C,
        pool_is_closing: bool,
    ) -> Result<(), Rejected<C>> {
        if pool_is_closing {
            return Err(Rejected {
                connection,
                reason: RejectReason::PoolClosing,
            });
        }
        if !connection.is_alive() {
            return Err(Rejected {
                connection,
                reason: RejectReason::NotAlive,
            });
        }
        loop {
            let pool = match self.pool_for(route, max_connections) {
                Ok(pool) => pool,
                Err(error) => {
                    debug!(connection_id = %connection.id(), %error, "released connection does not fit its route pool");
                    return Err(Rejected {
                        connection,
                        reason: RejectReason::SizeMismatch,
                    });
                }
            };
            let mut state = pool.state.lock();
            if state.retired {
                continue;
            }
            if state.idle.len() >= pool.max_connections {
                return Err(Rejected {
                    connection,
                    reason: RejectReason::PoolFull,
                });
            }
            state.idle.push_front(IdleEntry {
                connection,
                released_at: Instant::now(),
            });
            return Ok(());
        }
    }

    /// 清扫所有路由：淘汰超时或失效的空闲连接，并删除清空的路由池。
    pub fn cleanup_idle<F>(&self, mut on_evict: F) -> CleanupReport
    where
        F: FnMut(&C, CloseReason),
    {
        let mut report = CleanupReport::default();
        for (route, pool) in self.snapshot() {
            let expired = {
                let mut state = pool.state.lock();
                let mut kept = VecDeque::with_capacity(state.idle.len());
                let mut expired = Vec::new();
                for entry in state.idle.drain(..) {
                    let timed_out = entry.released_at.elapsed() > self.max_idle_time;
                    let alive = entry.connection.is_alive();
                    if timed_out && alive {
                        expired.push((entry.connection, CloseReason::IdleTimeout));
                    } else if !alive {
                        expired.push((entry.connection, CloseReason::UnexpectedClose));
                    } else {
                        kept.push_back(entry);
                    }
                }
                state.idle = kept;
                if state.idle.is_empty() {
                    state.retired = true;
                    self.pools
                        .remove_if(&route, |_, current| Arc::ptr_eq(current, &pool));
                    trace!(route = %route, "removed empty route pool");
                }
                expired
            };
            for (mut connection, reason) in expired {
                if let Err(error) = connection.close() {
                    report.errors.push(error);
                }
                report.evicted += 1;
                on_evict(&connection, reason);
            }
        }
        report
    }

    /// 关闭全部空闲连接，IO 错误追加到 `errors` 而不中断。
    pub fn close_all<F>(&self, errors: &mut Vec<io::Error>, mut on_each: F)
    where
        F: FnMut(&C),
    {
        for (route, pool) in self.snapshot() {
            let drained: Vec<C> = {
                let mut state = pool.state.lock();
                state.retired = true;
                self.pools
                    .remove_if(&route, |_, current| Arc::ptr_eq(current, &pool));
                state.idle.drain(..).map(|entry| entry.connection).collect()
            };
            for mut connection in drained {
                if let Err(error) = connection.close() {
                    errors.push(error);
                }
                on_each(&connection);
            }
        }
    }

    /// 把指定空闲连接从路由池中摘出，交给调用方处理。
    pub fn remove(&self, route: &Route, id: ConnectionId) -> Option<C> {
        let pool = self.pools.get(route).map(|entry| Arc::clone(entry.value()))?;
        let mut state = pool.state.lock();
        let position = state
            .idle
            .iter()
            .position(|entry| entry.connection.id() == id)?;
        state.idle.remove(position).map(|entry| entry.connection)
    }

    pub fn idle_count(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|(_, pool)| pool.state.lock().idle.len())
            .sum()
    }

    pub fn idle_count_for(&self, route: &Route) -> usize {
        self.pools
            .get(route)
            .map(|entry| Arc::clone(entry.value()))
            .map_or(0, |pool| pool.state.lock().idle.len())
    }

    pub fn route_count(&self) -> usize {
        self.pools.len()
    }

    fn snapshot(&self) -> Vec<(Route, Arc<RoutePool<C>>)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Scheme;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing_test::traced_test;

    #[derive(Clone)]
    struct Flags {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        probe_ok: Arc<AtomicBool>,
    }

    struct FakeConnection {
        id: ConnectionId,
        flags: Flags,
    }

    fn fake() -> (FakeConnection, Flags) {
        let flags = Flags {
            alive: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
            probe_ok: Arc::new(AtomicBool::new(true)),
        };
        (
            FakeConnection {
                id: ConnectionId::next(),
                flags: flags.clone(),
            },
            flags,
        )
    }

    impl PooledConnection for FakeConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn is_alive(&self) -> bool {
            self.flags.alive.load(Ordering::SeqCst) && !self.flags.closed.load(Ordering::SeqCst)
        }

        fn probe(&mut self) -> bool {
            self.flags.probe_ok.load(Ordering::SeqCst)
        }

        fn close(&mut self) -> io::Result<()> {
            self.flags.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn route() -> Route {
        Route::new(Scheme::Https, "pool.example", 443).expect("路由应合法")
    }

    #[tokio::test]
    async fn released_connection_is_reacquired_lifo() {
        let pools = RoutePools::new(Duration::from_secs(30));
        let (first, _) = fake();
        let (second, _) = fake();
        let (first_id, second_id) = (first.id, second.id);

        pools.release(&route(), 10, first, false).expect("应入池");
        pools.release(&route(), 10, second, false).expect("应入池");

        let reused = pools.try_acquire(&route(), 10).expect("上限一致").expect("应有空闲连接");
        assert_eq!(reused.id, second_id, "最近归还的连接优先");
        let reused = pools.try_acquire(&route(), 10).expect("上限一致").expect("应有空闲连接");
        assert_eq!(reused.id, first_id);
        assert!(pools.try_acquire(&route(), 10).expect("上限一致").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_connection_is_closed_instead_of_returned() {
        let pools = RoutePools::new(Duration::from_millis(10));
        let (connection, flags) = fake();
        pools.release(&route(), 10, connection, false).expect("应入池");

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut evicted = Vec::new();
        let acquired = pools
            .try_acquire_with(&route(), 10, |_, reason| evicted.push(reason))
            .expect("上限一致");
        assert!(acquired.is_none());
        assert!(flags.closed.load(Ordering::SeqCst), "过期连接应被关闭");
        assert_eq!(evicted, vec![CloseReason::IdleTimeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_idle_connection_is_probed_before_reuse() {
        let pools = RoutePools::new(Duration::from_secs(30));
        let (connection, flags) = fake();
        flags.probe_ok.store(false, Ordering::SeqCst);
        pools.release(&route(), 10, connection, false).expect("应入池");

        tokio::time::sleep(Duration::from_millis(500)).await;
        let reused = pools.try_acquire(&route(), 10).expect("上限一致");
        assert!(reused.is_some(), "未超过校验阈值时不探测");
        pools
            .release(&route(), 10, reused.expect("已检查"), false)
            .expect("应入池");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut evicted = Vec::new();
        let reused = pools
            .try_acquire_with(&route(), 10, |_, reason| evicted.push(reason))
            .expect("上限一致");
        assert!(reused.is_none());
        assert_eq!(evicted, vec![CloseReason::UnexpectedClose]);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let pools: RoutePools<FakeConnection> = RoutePools::new(Duration::from_secs(30));
        pools.get_or_create_pool(&route(), 10).expect("首次创建");
        pools.get_or_create_pool(&route(), 10).expect("同样的上限可重复调用");
        let error = pools.get_or_create_pool(&route(), 5).expect_err("上限不同应失败");
        assert!(matches!(
            error,
            PoolError::SizeMismatch {
                existing: 10,
                requested: 5,
                ..
            }
        ));
    }

    #[test]
    fn release_hands_back_dead_full_or_closing() {
        let pools = RoutePools::new(Duration::from_secs(30));
        let (dead, flags) = fake();
        flags.alive.store(false, Ordering::SeqCst);
        let rejected = pools.release(&route(), 1, dead, false).expect_err("失效连接不入池");
        assert_eq!(rejected.reason, RejectReason::NotAlive);
        assert_eq!(rejected.reason.close_reason(), CloseReason::UnexpectedClose);

        let (healthy, _) = fake();
        let rejected = pools.release(&route(), 1, healthy, true).expect_err("关闭中不入池");
        assert_eq!(rejected.reason, RejectReason::PoolClosing);

        let (first, _) = fake();
        let (second, _) = fake();
        pools.release(&route(), 1, first, false).expect("应入池");
        let rejected = pools.release(&route(), 1, second, false).expect_err("列表已满");
        assert_eq!(rejected.reason, RejectReason::PoolFull);
        assert_eq!(pools.idle_count(), 1);
    }

    #[test]
    #[traced_test]
    fn release_with_a_different_limit_reports_the_mismatch() {
        let pools = RoutePools::new(Duration::from_secs(30));
        let (first, _) = fake();
        pools.release(&route(), 4, first, false).expect("应入池");

        let (second, _) = fake();
        let rejected = pools
            .release(&route(), 2, second, false)
            .expect_err("上限不一致不入池");
        assert_eq!(rejected.reason, RejectReason::SizeMismatch);
        assert_eq!(rejected.reason.close_reason(), CloseReason::Evicted);
        assert_eq!(pools.idle_count(), 1);
        assert!(logs_contain("released connection does not fit its route pool"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_empty_pools_and_frees_the_route() {
        let pools = RoutePools::new(Duration::from_millis(10));
        let (stale, stale_flags) = fake();
        let (dead, dead_flags) = fake();
        pools.release(&route(), 10, stale, false).expect("应入池");
        pools.release(&route(), 10, dead, false).expect("应入池");
        dead_flags.alive.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut reasons = Vec::new();
        let report = pools.cleanup_idle(|_, reason| reasons.push(reason));
        assert_eq!(report.evicted, 2);
        assert!(report.errors.is_empty());
        assert!(stale_flags.closed.load(Ordering::SeqCst));
        reasons.sort_by_key(|reason| reason.as_str());
        assert_eq!(
            reasons,
            vec![CloseReason::IdleTimeout, CloseReason::UnexpectedClose]
        );
        assert_eq!(pools.route_count(), 0);

        pools
            .get_or_create_pool(&route(), 3)
            .expect("清理后可以用新的上限重建");
    }

    #[test]
    fn remove_and_close_all() {
        let pools = RoutePools::new(Duration::from_secs(30));
        let (kept, kept_flags) = fake();
        let (removed, _) = fake();
        let removed_id = removed.id;
        pools.release(&route(), 10, kept, false).expect("应入池");
        pools.release(&route(), 10, removed, false).expect("应入池");

        let taken = pools.remove(&route(), removed_id).expect("应找到指定连接");
        assert_eq!(taken.id, removed_id);
        assert!(pools.remove(&route(), removed_id).is_none());

        let mut errors = Vec::new();
        let mut closed = 0;
        pools.close_all(&mut errors, |_| closed += 1);
        assert!(errors.is_empty());
        assert_eq!(closed, 1);
        assert!(kept_flags.closed.load(Ordering::SeqCst));
        assert_eq!(pools.idle_count(), 0);
        assert_eq!(pools.route_count(), 0);
    }
}
