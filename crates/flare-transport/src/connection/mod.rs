//! 物理连接与其协议形态。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 建连时根据 ALPN 结果一次性决定协议，之后以 [`Connection`] 枚举携带，
//!   避免在交换路径上反复判断版本；
//! - [`PooledConnection`] 把“可入池”所需的最小能力抽出来，使 HTTP/1.1 空闲池
//!   的规则可以用假连接单独验证。
//!
//! ## 契约（What）
//! - `ConnectionId` 在进程内单调递增且不复用；
//! - `close` 幂等，重复调用返回 `Ok(())`；
//! - 每条物理连接持有一个全局连接许可，许可随连接关闭（或析构）归还。

pub(crate) mod http1;
pub(crate) mod http2;

pub use http1::H1Connection;
pub use http2::{H2Connection, H2Lease};

use crate::route::Route;
use http::Version;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的连接标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 可被 [`RoutePools`](crate::RoutePools) 管理的连接。
///
/// - `is_alive`：廉价的本地状态检查，不做 IO；
/// - `probe`：非阻塞的存活探测，只在连接空闲超过校验阈值后调用；
/// - `close`：释放底层资源，幂等。
pub trait PooledConnection: Send + 'static {
    fn id(&self) -> ConnectionId;

    fn is_alive(&self) -> bool;

    fn probe(&mut self) -> bool;

    fn close(&mut self) -> io::Result<()>;
}

/// 监听器与日志使用的连接摘要。
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub route: Route,
    pub version: Version,
}

/// 一次请求可使用的连接：HTTP/1.1 独占连接，或 h2 连接上的一个流槽位。
#[derive(Debug)]
pub enum Connection {
    Http1(H1Connection),
    Http2(H2Lease),
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        match self {
            Self::Http1(connection) => connection.id(),
            Self::Http2(lease) => lease.connection().id(),
        }
    }

    pub fn route(&self) -> &Route {
        match self {
            Self::Http1(connection) => connection.route(),
            Self::Http2(lease) => lease.connection().route(),
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Self::Http1(_) => Version::HTTP_11,
            Self::Http2(_) => Version::HTTP_2,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Self::Http1(connection) => connection.is_alive(),
            Self::Http2(lease) => lease.connection().is_alive(),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        match self {
            Self::Http1(connection) => connection.info(),
            Self::Http2(lease) => lease.connection().info(),
        }
    }
}
