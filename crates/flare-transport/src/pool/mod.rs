//! 连接池：HTTP/1.1 空闲池、h2 连接注册表与全局连接许可。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 两种协议的“复用”含义不同：HTTP/1.1 连接在交换之间回到空闲列表，h2 连接常驻
//!   注册表、按流槽位共享；[`ConnectionPool`] 把两者统一在 `acquire`/`release` 之后；
//! - 连接池是显式构造、显式关闭的组件，由 [`HttpTransport`](crate::HttpTransport)
//!   持有，从不作为全局状态存在。
//!
//! ## 逻辑（How）
//! - 版本策略与路由协议决定走 h2 还是 HTTP/1.1 路径；`https` + `Negotiate` 先走 h2，
//!   若对端经 ALPN 选择了 HTTP/1.1，路由被记入 `h1_routes`，之后直接走 HTTP/1.1 路径；
//!   该记录随路由的空闲连接一同清扫，路由再无空闲连接时下一次建连重新协商；
//! - 新建连接前先取得全局许可（`max_total_connections`），许可随物理连接一同释放；
//! - 后台清扫任务只持有弱引用，每个 `cleanup_interval` 执行一次 [`ConnectionPool::cleanup_idle`]。
//!
//! ## 契约（What）
//! - `acquire` 永不交出不可用的连接；`acquire_timeout == 0` 时许可不足立即失败；
//! - 每次连接关闭恰好通知一次监听器，并附带 [`CloseReason`]；
//! - `close_all` 之后 `acquire` 返回 [`PoolError::Closed`]，仍在外借的连接归还时直接关闭。
//!
//! ## 风险（Trade-offs）
//! - h2 新建连接在同一路由上串行化，等待许可期间同路由的其它调用方也会排队；
//!   换来的是并发调用方共享同一条新连接，而不是各自握手。

mod h2_registry;
mod listener;
mod route_pools;

pub use h2_registry::H2Registry;
pub use listener::{CloseReason, PoolListener};
pub use route_pools::{CleanupReport, RejectReason, Rejected, RoutePools, VALIDATION_THRESHOLD};

use crate::config::{HttpVersionPolicy, TransportConfig};
use crate::connection::{
    Connection, ConnectionInfo, H1Connection, H2Connection, H2Lease, PooledConnection,
};
use crate::connector::{Connector, Established};
use crate::error::{ACQUIRE, PoolError, TransportError};
use crate::route::Route;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 连接池状态快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// HTTP/1.1 空闲连接数。
    pub idle_connections: usize,
    /// 存在的 HTTP/1.1 路由池数量。
    pub route_pools: usize,
    pub h2_connections: usize,
    pub h2_active_streams: usize,
    pub connections_created: u64,
    pub connections_reused: u64,
    pub connections_closed: u64,
    pub acquire_timeouts: u64,
    /// 已被物理连接占用的全局许可数。
    pub permits_in_use: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    acquire_timeouts: AtomicU64,
}

struct PoolInner {
    config: TransportConfig,
    connector: Connector,
    h1: RoutePools<H1Connection>,
    h2: H2Registry,
    h1_routes: DashSet<Route>,
    permits: Arc<Semaphore>,
    listeners: Vec<Arc<dyn PoolListener>>,
    closing: AtomicBool,
    counters: Counters,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.abort();
        }
    }
}

/// 按路由复用物理连接的连接池。
///
/// 克隆得到的句柄共享同一组连接；最后一个句柄析构时后台清扫任务随之结束，
/// 池中剩余连接在析构时关闭。
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        Self::with_listeners(config, Vec::new())
    }

    /// 构造连接池并登记生命周期监听器。
    ///
    /// 在 Tokio 运行时之内调用时会启动后台清扫任务；运行时之外构造的池只在
    /// `acquire` 与显式 `cleanup_idle` 时淘汰空闲连接。
    pub fn with_listeners(
        config: TransportConfig,
        listeners: Vec<Arc<dyn PoolListener>>,
    ) -> Result<Self, TransportError> {
        let connector = Connector::new(&config)?;
        let inner = Arc::new(PoolInner {
            h1: RoutePools::new(config.max_idle_time()),
            h2: H2Registry::new(),
            h1_routes: DashSet::new(),
            permits: Arc::new(Semaphore::new(config.max_total_connections())),
            listeners,
            closing: AtomicBool::new(false),
            counters: Counters::default(),
            cleanup_task: Mutex::new(None),
            connector,
            config,
        });
        let task = spawn_cleanup_task(&inner);
        *inner.cleanup_task.lock() = task;
        Ok(Self { inner })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// 为 `route` 取得一个可用连接：优先复用，必要时在许可范围内新建。
    pub async fn acquire(&self, route: &Route) -> Result<Connection, TransportError> {
        if self.is_closing() {
            return Err(PoolError::Closed.into());
        }
        let policy = self.inner.config.http_version_policy();
        if policy.prefers_h2(route.is_secure()) && !self.inner.h1_routes.contains(route) {
            self.acquire_h2(route).await
        } else {
            self.acquire_h1(route).await
        }
    }

    async fn acquire_h1(&self, route: &Route) -> Result<Connection, TransportError> {
        let max = self.inner.config.max_connections_for(route);
        let reused = self.inner.h1.try_acquire_with(route, max, |connection, reason| {
            self.notify_closed(&connection.info(), reason);
        })?;
        if let Some(connection) = reused {
            return Ok(self.hand_out_reused(Connection::Http1(connection)));
        }
        let permit = self.acquire_permit().await?;
        let established = self.inner.connector.connect(route).await?;
        self.adopt(route, established, permit).await
    }

    async fn acquire_h2(&self, route: &Route) -> Result<Connection, TransportError> {
        let streams = self.inner.config.h2_streams_per_connection();
        if let Some(lease) = self.inner.h2.try_acquire_under_limit(route, streams) {
            return Ok(self.hand_out_reused(Connection::Http2(lease)));
        }

        let creation = self.inner.h2.creation_lock(route);
        let creating = creation.lock_owned().await;
        if let Some(lease) = self.inner.h2.try_acquire_under_limit(route, streams) {
            return Ok(self.hand_out_reused(Connection::Http2(lease)));
        }
        if self.inner.h1_routes.contains(route) {
            drop(creating);
            return self.acquire_h1(route).await;
        }
        for dead in self.inner.h2.cleanup_dead(route) {
            if let Err(error) = dead.close() {
                debug!(connection_id = %dead.id(), %error, "error closing dead h2 connection");
            }
            self.notify_closed(&dead.info(), CloseReason::UnexpectedClose);
        }

        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed.into()),
            Err(TryAcquireError::NoPermits) => {
                // 许可耗尽时先溢出到现有连接，只受对端并发上限约束。
                if let Some(lease) = self.inner.h2.try_acquire(route, streams) {
                    return Ok(self.hand_out_reused(Connection::Http2(lease)));
                }
                self.acquire_permit().await?
            }
        };
        let established = self.inner.connector.connect(route).await?;
        self.adopt(route, established, permit).await
    }

    /// 把新建立的字节流包装为连接并登记。
    async fn adopt(
        &self,
        route: &Route,
        established: Established,
        permit: OwnedSemaphorePermit,
    ) -> Result<Connection, TransportError> {
        let connection = match established {
            Established::Http2(stream) => {
                let connection =
                    H2Connection::handshake(route.clone(), stream, &self.inner.config, Some(permit))
                        .await?;
                self.inner.h2.register(connection.clone());
                self.inner.h1_routes.remove(route);
                Connection::Http2(connection.lease())
            }
            Established::Http1(stream) => {
                if self.inner.config.http_version_policy() == HttpVersionPolicy::Negotiate
                    && route.is_secure()
                {
                    trace!(route = %route, "peer negotiated http/1.1; routing future requests to the idle pool");
                    self.inner.h1_routes.insert(route.clone());
                }
                Connection::Http1(H1Connection::new(route.clone(), stream, Some(permit)))
            }
        };
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        let info = connection.info();
        debug!(
            route = %info.route,
            connection_id = %info.id,
            version = ?info.version,
            "connection established"
        );
        for listener in &self.inner.listeners {
            listener.on_connected(&info);
            listener.on_acquire(&info, false);
        }
        Ok(connection)
    }

    fn hand_out_reused(&self, connection: Connection) -> Connection {
        self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
        let info = connection.info();
        trace!(route = %info.route, connection_id = %info.id, "connection reused");
        for listener in &self.inner.listeners {
            listener.on_acquire(&info, true);
        }
        connection
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, TransportError> {
        let timeout = self.inner.config.acquire_timeout();
        let permits = Arc::clone(&self.inner.permits);
        let result = if timeout.is_zero() {
            match permits.try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::Closed) => return Err(PoolError::Closed.into()),
                Err(TryAcquireError::NoPermits) => Err(()),
            }
        } else {
            match tokio::time::timeout(timeout, permits.acquire_owned()).await {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => return Err(PoolError::Closed.into()),
                Err(_) => Err(()),
            }
        };
        result.map_err(|()| {
            self.inner
                .counters
                .acquire_timeouts
                .fetch_add(1, Ordering::Relaxed);
            let limit = self.inner.config.max_total_connections();
            warn!(
                code = ACQUIRE.code,
                limit,
                waited = ?timeout,
                "connection permits exhausted"
            );
            TransportError::Pool(PoolError::Exhausted {
                limit,
                waited: timeout,
            })
        })
    }

    /// 交换结束后归还连接。
    ///
    /// HTTP/1.1 连接回到路由空闲池，被拒绝时立即关闭；h2 只归还流槽位，
    /// 已失效的连接随之从注册表摘除。
    pub fn release(&self, connection: Connection) {
        match connection {
            Connection::Http1(connection) => self.release_h1(connection),
            Connection::Http2(lease) => self.settle_h2(lease),
        }
    }

    fn release_h1(&self, connection: H1Connection) {
        let info = connection.info();
        for listener in &self.inner.listeners {
            listener.on_return(&info);
        }
        let max = self.inner.config.max_connections_for(&info.route);
        let released = self
            .inner
            .h1
            .release(&info.route, max, connection, self.is_closing());
        if let Err(Rejected {
            mut connection,
            reason,
        }) = released
        {
            if let Err(error) = connection.close() {
                debug!(connection_id = %info.id, %error, "error closing rejected connection");
            }
            self.notify_closed(&info, reason.close_reason());
        }
    }

    pub(crate) fn settle_h2(&self, lease: H2Lease) {
        let connection = lease.connection().clone();
        drop(lease);
        let info = connection.info();
        for listener in &self.inner.listeners {
            listener.on_return(&info);
        }
        let reason = if !connection.is_alive() {
            CloseReason::UnexpectedClose
        } else if self.is_closing() && connection.active_streams() == 0 {
            CloseReason::PoolShutdown
        } else {
            return;
        };
        if self.inner.h2.unregister(&connection) {
            if let Err(error) = connection.close() {
                debug!(connection_id = %info.id, %error, "error closing h2 connection");
            }
            self.notify_closed(&info, reason);
        }
    }

    /// 带外驱逐：连接不再回到池中。
    pub fn evict(&self, connection: Connection, is_error: bool) {
        let reason = if is_error {
            CloseReason::Errored
        } else {
            CloseReason::Evicted
        };
        match connection {
            Connection::Http1(mut connection) => {
                let info = connection.info();
                if let Err(error) = connection.close() {
                    debug!(connection_id = %info.id, %error, "error closing evicted connection");
                }
                self.notify_closed(&info, reason);
            }
            Connection::Http2(lease) => {
                let connection = lease.connection().clone();
                drop(lease);
                if self.inner.h2.unregister(&connection) {
                    let info = connection.info();
                    if let Err(error) = connection.close() {
                        debug!(connection_id = %info.id, %error, "error closing evicted connection");
                    }
                    self.notify_closed(&info, reason);
                }
            }
        }
    }

    /// 执行一次清扫：HTTP/1.1 空闲超时与失效连接，以及已失效的 h2 连接。
    pub fn cleanup_idle(&self) -> CleanupReport {
        let mut report = self.inner.h1.cleanup_idle(|connection, reason| {
            self.notify_closed(&connection.info(), reason);
        });
        self.inner
            .h1_routes
            .retain(|route| self.inner.h1.idle_count_for(route) > 0);
        for connection in self.inner.h2.cleanup_all_dead() {
            if let Err(error) = connection.close() {
                report.errors.push(error);
            }
            report.evicted += 1;
            self.notify_closed(&connection.info(), CloseReason::UnexpectedClose);
        }
        report
    }

    /// 标记关闭并关闭全部 h2 连接与 HTTP/1.1 空闲连接。
    ///
    /// 所有关闭错误被汇总为一个 [`TransportError::Cleanup`]，不会因首个失败而中断。
    pub fn close_all(&self) -> Result<(), TransportError> {
        self.inner.closing.store(true, Ordering::Release);
        let mut errors = Vec::new();
        for connection in self.inner.h2.close_all() {
            if let Err(error) = connection.close() {
                errors.push(error);
            }
            self.notify_closed(&connection.info(), CloseReason::PoolShutdown);
        }
        self.inner.h1.close_all(&mut errors, |connection| {
            self.notify_closed(&connection.info(), CloseReason::PoolShutdown);
        });
        if let Some(task) = self.inner.cleanup_task.lock().take() {
            task.abort();
        }
        self.inner.permits.close();
        debug!(errors = errors.len(), "connection pool closed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Cleanup { errors })
        }
    }

    /// 停止接受新的 `acquire`，在 `grace` 内等待外借连接归还，然后 `close_all`。
    pub async fn shutdown(&self, grace: Duration) -> Result<(), TransportError> {
        self.inner.closing.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;
        loop {
            let leased = self.leased_connections();
            if leased == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(leased, "shutdown grace period elapsed with connections still leased");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL.min(deadline - now)).await;
        }
        self.close_all()
    }

    fn permits_in_use(&self) -> usize {
        self.inner
            .config
            .max_total_connections()
            .saturating_sub(self.inner.permits.available_permits())
    }

    fn leased_connections(&self) -> usize {
        let (_, idle_h2, _) = self.inner.h2.snapshot_counts();
        self.permits_in_use()
            .saturating_sub(self.inner.h1.idle_count())
            .saturating_sub(idle_h2)
    }

    pub fn statistics(&self) -> PoolStats {
        let (h2_connections, _, h2_active_streams) = self.inner.h2.snapshot_counts();
        let counters = &self.inner.counters;
        PoolStats {
            idle_connections: self.inner.h1.idle_count(),
            route_pools: self.inner.h1.route_count(),
            h2_connections,
            h2_active_streams,
            connections_created: counters.created.load(Ordering::Relaxed),
            connections_reused: counters.reused.load(Ordering::Relaxed),
            connections_closed: counters.closed.load(Ordering::Relaxed),
            acquire_timeouts: counters.acquire_timeouts.load(Ordering::Relaxed),
            permits_in_use: self.permits_in_use(),
        }
    }

    fn notify_closed(&self, info: &ConnectionInfo, reason: CloseReason) {
        self.inner.counters.closed.fetch_add(1, Ordering::Relaxed);
        debug!(
            route = %info.route,
            connection_id = %info.id,
            reason = reason.as_str(),
            "connection closed"
        );
        for listener in &self.inner.listeners {
            listener.on_closed(info, reason);
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("closing", &self.is_closing())
            .field("stats", &self.statistics())
            .finish()
    }
}

fn spawn_cleanup_task(inner: &Arc<PoolInner>) -> Option<JoinHandle<()>> {
    let Ok(handle) = Handle::try_current() else {
        warn!("no tokio runtime; idle connections are only swept on acquire");
        return None;
    };
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let period = inner.config.cleanup_interval();
    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.closing.load(Ordering::Acquire) {
                return;
            }
            let report = ConnectionPool { inner }.cleanup_idle();
            if report.evicted > 0 || !report.errors.is_empty() {
                debug!(
                    evicted = report.evicted,
                    errors = report.errors.len(),
                    "idle sweep finished"
                );
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Scheme;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    /// 只接受连接、从不回写的对端；保持套接字存活直到测试结束。
    async fn silent_peer() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定回环端口");
        let port = listener.local_addr().expect("本地地址").port();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (port, task)
    }

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        reused: AtomicUsize,
        closed: parking_lot::Mutex<Vec<CloseReason>>,
    }

    impl PoolListener for Recorder {
        fn on_connected(&self, _info: &ConnectionInfo) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_acquire(&self, _info: &ConnectionInfo, reused: bool) {
            if reused {
                self.reused.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_closed(&self, _info: &ConnectionInfo, reason: CloseReason) {
            self.closed.lock().push(reason);
        }
    }

    fn config() -> TransportConfig {
        TransportConfig::builder()
            .max_total_connections(2)
            .acquire_timeout(Duration::ZERO)
            .build()
            .expect("配置合法")
    }

    #[tokio::test]
    async fn released_connection_is_reused_lifo() {
        let (port, _peer) = silent_peer().await;
        let recorder = Arc::new(Recorder::default());
        let pool = ConnectionPool::with_listeners(config(), vec![recorder.clone() as Arc<dyn PoolListener>])
            .expect("构造连接池");
        let route = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由合法");

        let first = pool.acquire(&route).await.expect("首次建连");
        let id = first.id();
        assert_eq!(first.version(), http::Version::HTTP_11);
        pool.release(first);
        assert_eq!(pool.statistics().idle_connections, 1);

        let again = pool.acquire(&route).await.expect("复用空闲连接");
        assert_eq!(again.id(), id);
        let stats = pool.statistics();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.connections_reused, 1);
        assert_eq!(stats.permits_in_use, 1);
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.reused.load(Ordering::SeqCst), 1);
        pool.release(again);
    }

    #[tokio::test]
    async fn exhausted_permits_fail_fast_with_zero_timeout() {
        let (port, _peer) = silent_peer().await;
        let pool = ConnectionPool::new(config()).expect("构造连接池");
        let route = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由合法");

        let first = pool.acquire(&route).await.expect("第一条连接");
        let second = pool.acquire(&route).await.expect("第二条连接");
        let error = pool.acquire(&route).await.expect_err("许可已耗尽");
        assert!(matches!(
            error,
            TransportError::Pool(PoolError::Exhausted { limit: 2, .. })
        ));
        assert_eq!(pool.statistics().acquire_timeouts, 1);

        pool.evict(first, true);
        let third = pool.acquire(&route).await.expect("驱逐后许可归还");
        assert_ne!(third.id(), second.id());
    }

    #[tokio::test]
    #[traced_test]
    async fn close_all_closes_idle_connections_and_rejects_acquire() {
        let (port, _peer) = silent_peer().await;
        let recorder = Arc::new(Recorder::default());
        let pool = ConnectionPool::with_listeners(config(), vec![recorder.clone() as Arc<dyn PoolListener>])
            .expect("构造连接池");
        let route = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由合法");

        let idle = pool.acquire(&route).await.expect("空闲连接");
        let leased = pool.acquire(&route).await.expect("外借连接");
        pool.release(idle);

        pool.close_all().expect("关闭不应出错");
        assert_eq!(*recorder.closed.lock(), vec![CloseReason::PoolShutdown]);
        assert!(logs_contain("connection pool closed"));

        pool.release(leased);
        assert_eq!(
            *recorder.closed.lock(),
            vec![CloseReason::PoolShutdown, CloseReason::PoolShutdown]
        );
        let error = pool.acquire(&route).await.expect_err("关闭后拒绝借出");
        assert!(matches!(error, TransportError::Pool(PoolError::Closed)));
        assert_eq!(pool.statistics().permits_in_use, 0);
    }

    #[tokio::test]
    async fn per_host_limit_bounds_the_idle_list() {
        let (port, _peer) = silent_peer().await;
        let recorder = Arc::new(Recorder::default());
        let config = TransportConfig::builder()
            .max_connections_for_host("127.0.0.1", 1)
            .build()
            .expect("配置合法");
        let pool = ConnectionPool::with_listeners(config, vec![recorder.clone() as Arc<dyn PoolListener>])
            .expect("构造连接池");
        let route = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由合法");

        let first = pool.acquire(&route).await.expect("第一条连接");
        let second = pool.acquire(&route).await.expect("第二条连接");
        pool.release(first);
        pool.release(second);

        assert_eq!(pool.statistics().idle_connections, 1);
        assert_eq!(*recorder.closed.lock(), vec![CloseReason::PoolFull]);
    }

    #[tokio::test]
    async fn cleanup_forgets_http11_routes_without_idle_connections() {
        let (port, _peer) = silent_peer().await;
        let config = TransportConfig::builder()
            .max_idle_time(Duration::from_millis(50))
            .build()
            .expect("配置合法");
        let pool = ConnectionPool::new(config).expect("构造连接池");
        let kept = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由合法");
        let gone = Route::new(Scheme::Https, "gone.example", 443).expect("路由合法");
        pool.inner.h1_routes.insert(kept.clone());
        pool.inner.h1_routes.insert(gone.clone());

        let connection = pool.acquire(&kept).await.expect("建连");
        pool.release(connection);
        pool.cleanup_idle();
        assert!(pool.inner.h1_routes.contains(&kept));
        assert!(!pool.inner.h1_routes.contains(&gone));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = pool.cleanup_idle();
        assert_eq!(report.evicted, 1);
        assert!(pool.inner.h1_routes.is_empty());
        assert_eq!(pool.statistics().route_pools, 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_leased_connections() {
        let (port, _peer) = silent_peer().await;
        let pool = ConnectionPool::new(config()).expect("构造连接池");
        let route = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由合法");
        let leased = pool.acquire(&route).await.expect("外借连接");

        let releaser = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                pool.release(leased);
            })
        };
        let started = Instant::now();
        pool.shutdown(Duration::from_secs(5)).await.expect("优雅关闭");
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
        releaser.await.expect("归还任务");
        assert_eq!(pool.statistics().permits_in_use, 0);
    }
}
