//! HTTP/2 多路复用连接。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 一条 h2 连接被多个交换共享，每个交换占用一个流槽位；连接对象只负责
//!   槽位仲裁，流 ID 的分配完全交给 `h2`；
//! - 连接驱动（`h2::client::Connection`）运行在独立任务上，任务结束即意味着连接失效。
//!
//! ## 逻辑（How）
//! - 槽位计数使用 CAS 循环，上限取“软目标”与对端 `SETTINGS_MAX_CONCURRENT_STREAMS` 的较小值；
//! - [`H2Lease`] 析构时归还槽位，无需调用方显式释放；
//! - 驱动任务只持有弱引用，结束时置位 `closed`。
//!
//! ## 契约（What）
//! - `try_lease(Some(n))` 只在活跃流数小于 `min(n, 对端上限)` 时成功；
//!   `try_lease(None)` 只受对端上限约束；
//! - `close` 中止驱动任务并归还全局连接许可，进行中的流随之失败。

use super::{ConnectionId, ConnectionInfo};
use crate::config::TransportConfig;
use crate::error::{H2_HANDSHAKE, TransportError, h2_error};
use crate::route::Route;
use bytes::Bytes;
use h2::client::SendRequest;
use http::Version;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::debug;

/// 可共享的 h2 连接句柄。
#[derive(Clone)]
pub struct H2Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    route: Route,
    send_request: SendRequest<Bytes>,
    closed: AtomicBool,
    active: AtomicUsize,
    driver: Mutex<Option<JoinHandle<()>>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl H2Connection {
    /// 在已建立的字节流上完成 h2 握手并启动连接驱动任务。
    pub(crate) async fn handshake<T>(
        route: Route,
        io: T,
        config: &TransportConfig,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Self, TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let window = config.h2_initial_window_size();
        let (send_request, connection) = h2::client::Builder::new()
            .initial_window_size(window)
            .initial_connection_window_size(window)
            .enable_push(false)
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|error| h2_error(H2_HANDSHAKE, error))?;

        let inner = Arc::new(Inner {
            id: ConnectionId::next(),
            route,
            send_request,
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            driver: Mutex::new(None),
            permit: Mutex::new(permit),
        });
        let weak = Arc::downgrade(&inner);
        let id = inner.id;
        let driver = tokio::spawn(async move {
            match connection.await {
                Ok(()) => debug!(connection_id = %id, "h2 connection finished"),
                Err(error) => debug!(connection_id = %id, %error, "h2 connection failed"),
            }
            if let Some(inner) = weak.upgrade() {
                inner.closed.store(true, Ordering::Release);
            }
        });
        *inner.driver.lock() = Some(driver);
        debug!(connection_id = %id, route = %inner.route, "h2 connection established");
        Ok(Self { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn route(&self) -> &Route {
        &self.inner.route
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.inner.id,
            route: self.inner.route.clone(),
            version: Version::HTTP_2,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// 对端当前允许的并发流上限。
    pub fn peer_max_streams(&self) -> usize {
        self.inner.send_request.current_max_send_streams()
    }

    /// 在上限内预留一个流槽位。
    pub fn try_lease(&self, soft_limit: Option<usize>) -> Option<H2Lease> {
        if !self.is_alive() {
            return None;
        }
        let peer = self.peer_max_streams();
        let limit = soft_limit.map_or(peer, |soft| soft.min(peer));
        let mut current = self.inner.active.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match self.inner.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(H2Lease::new(self.clone())),
                Err(actual) => current = actual,
            }
        }
    }

    /// 无视上限强制预留，供新建连接的第一个交换使用。
    pub(crate) fn lease(&self) -> H2Lease {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        H2Lease::new(self.clone())
    }

    pub(crate) fn send_request(&self) -> SendRequest<Bytes> {
        self.inner.send_request.clone()
    }

    pub fn close(&self) -> io::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) && self.inner.permit.lock().is_none() {
            return Ok(());
        }
        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }
        self.inner.permit.lock().take();
        debug!(connection_id = %self.inner.id, "h2 connection closed");
        Ok(())
    }

    pub(crate) fn same_as(&self, other: &H2Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Connection")
            .field("id", &self.inner.id)
            .field("route", &self.inner.route)
            .field("alive", &self.is_alive())
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

/// h2 连接上的一个已预留流槽位，析构时归还。
pub struct H2Lease {
    connection: H2Connection,
}

impl H2Lease {
    fn new(connection: H2Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &H2Connection {
        &self.connection
    }
}

impl Drop for H2Lease {
    fn drop(&mut self) {
        self.connection.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for H2Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("H2Lease").field(&self.connection.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Scheme;

    async fn pair(max_streams: u32) -> (H2Connection, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut connection = h2::server::Builder::new()
                .max_concurrent_streams(max_streams)
                .handshake::<_, Bytes>(server)
                .await
                .expect("服务端握手");
            while let Some(request) = connection.accept().await {
                drop(request);
            }
        });
        let route = Route::new(Scheme::Http, "localhost", 8080).expect("路由应合法");
        let connection = H2Connection::handshake(route, client, &TransportConfig::default(), None)
            .await
            .expect("客户端握手");
        (connection, server)
    }

    #[tokio::test]
    async fn leases_respect_the_soft_limit_and_return_on_drop() {
        let (connection, _server) = pair(100).await;
        let first = connection.try_lease(Some(2)).expect("第一个槽位");
        let second = connection.try_lease(Some(2)).expect("第二个槽位");
        assert!(connection.try_lease(Some(2)).is_none(), "软目标已满");
        assert_eq!(connection.active_streams(), 2);

        let forced = connection.lease();
        assert_eq!(connection.active_streams(), 3);

        drop(first);
        drop(second);
        drop(forced);
        assert_eq!(connection.active_streams(), 0);
        assert!(connection.try_lease(Some(2)).is_some());
    }

    #[tokio::test]
    async fn closed_connection_hands_out_no_leases() {
        let (connection, _server) = pair(100).await;
        assert!(connection.is_alive());
        connection.close().expect("关闭应成功");
        assert!(!connection.is_alive());
        assert!(connection.try_lease(None).is_none());
        connection.close().expect("重复关闭应为空操作");
    }

    #[tokio::test]
    async fn peer_shutdown_marks_the_connection_dead() {
        let (connection, server) = pair(100).await;
        server.abort();
        let _ = server.await;
        for _ in 0..100 {
            if !connection.is_alive() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("对端离开后连接仍被视为存活");
    }
}
