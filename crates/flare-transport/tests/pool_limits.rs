//! `pool_limits` 集成测试：全局许可与每主机空闲上限。
//!
//! # 测试目标（Why）
//! - 全局许可耗尽时，`acquire` 在 `acquire_timeout` 后以 `PoolError::Exhausted` 失败，
//!   而不是无限等待；许可在等待期间被归还时，等待者应当拿到连接；
//! - 每主机上限中 `host:port` 条目优先于裸 `host` 条目，超出上限的归还连接被关闭。
//!
//! # 结构安排（How）
//! - 对端是只接受连接、从不读写的回环监听器，连接池只需要完成 TCP 建连；
//! - 直接操作 [`ConnectionPool`]，以 [`PoolStats`](flare_transport::PoolStats) 断言计数。

use flare_transport::{
    ConnectionPool, ErrorKind, PoolError, Route, Scheme, TransportConfig, TransportError,
};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

async fn silent_peer() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定回环地址应成功");
    let port = listener.local_addr().expect("应有本地地址").port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    port
}

fn route(port: u16) -> Route {
    Route::new(Scheme::Http, "127.0.0.1", port).expect("路由应合法")
}

#[tokio::test]
async fn acquire_times_out_when_permits_are_exhausted() {
    let port = silent_peer().await;
    let config = TransportConfig::builder()
        .max_total_connections(1)
        .acquire_timeout(Duration::from_millis(50))
        .build()
        .expect("配置应合法");
    let pool = ConnectionPool::new(config).expect("连接池应可构造");

    let leased = pool.acquire(&route(port)).await.expect("首次获取应成功");
    let started = Instant::now();
    let error = pool
        .acquire(&route(port))
        .await
        .expect_err("许可耗尽时应超时失败");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(matches!(
        error,
        TransportError::Pool(PoolError::Exhausted { limit: 1, .. })
    ));
    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert_eq!(pool.statistics().acquire_timeouts, 1);

    pool.release(leased);
    let reused = pool.acquire(&route(port)).await.expect("归还后应可复用");
    assert_eq!(pool.statistics().connections_reused, 1);
    pool.release(reused);
}

#[tokio::test]
async fn waiter_is_served_when_a_permit_frees() {
    let port = silent_peer().await;
    let config = TransportConfig::builder()
        .max_total_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .build()
        .expect("配置应合法");
    let pool = ConnectionPool::new(config).expect("连接池应可构造");

    let leased = pool.acquire(&route(port)).await.expect("首次获取应成功");
    let evictor = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        evictor.evict(leased, false);
    });

    let second = pool
        .acquire(&route(port))
        .await
        .expect("许可释放后等待者应拿到连接");
    let stats = pool.statistics();
    assert_eq!(stats.connections_created, 2);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.permits_in_use, 1);
    pool.release(second);
}

#[tokio::test]
async fn host_port_entry_overrides_bare_host_limit() {
    let port = silent_peer().await;
    let config = TransportConfig::builder()
        .max_connections_for_host("127.0.0.1", 1)
        .max_connections_for_host(&format!("127.0.0.1:{port}"), 2)
        .build()
        .expect("配置应合法");
    let pool = ConnectionPool::new(config).expect("连接池应可构造");

    let mut leased = Vec::new();
    for _ in 0..3 {
        leased.push(pool.acquire(&route(port)).await.expect("获取应成功"));
    }
    for connection in leased {
        pool.release(connection);
    }

    let stats = pool.statistics();
    assert_eq!(stats.idle_connections, 2);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.permits_in_use, 2);
}

#[tokio::test]
async fn closed_pool_rejects_new_acquires() {
    let port = silent_peer().await;
    let pool = ConnectionPool::new(TransportConfig::default()).expect("连接池应可构造");
    let connection = pool.acquire(&route(port)).await.expect("获取应成功");
    pool.release(connection);

    pool.close_all().expect("关闭应成功");
    assert!(pool.is_closing());
    assert_eq!(pool.statistics().idle_connections, 0);
    let error = pool.acquire(&route(port)).await.expect_err("已关闭的连接池应拒绝获取");
    assert_eq!(error.kind(), ErrorKind::Cancellation);
    assert_eq!(error.code(), "flare.transport.pool.closed");
}
