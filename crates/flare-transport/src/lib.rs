#![doc = r#"
# flare-transport

## 设计动机（Why）
- **定位**：RPC 客户端核心之下的连接层，负责把 `http::Request<DataStream>` 送到对端并取回
  `http::Response<DataStream>`，对上层隐藏 HTTP/1.1 与 HTTP/2 的差异。
- **架构角色**：依赖 `flare-stream` 提供的消息体与背压桥；自身持有连接池、建连器与
  两种协议的编解码。
- **设计理念**：连接按 [`Route`] 复用；协议在建连时由 ALPN 一次性决定，之后以标签枚举
  ([`Connection`] / [`Exchange`]) 携带。

## 核心契约（What）
- [`HttpTransport::send`]：到达响应头为止受 `request_timeout` 约束，出错时先关闭交换再返回；
- [`ConnectionPool`]：显式构造、显式关闭（`close_all` / `shutdown`），从不作为全局状态；
  全局连接数受 `max_total_connections` 许可约束，`acquire_timeout == 0` 时立即失败；
- [`TransportError`]：每个错误都有 [`ErrorKind`] 分类与稳定错误码，`evicts_connection()`
  决定连接去留。

## 实现策略（How）
- HTTP/1.1：`httparse` 解析响应头，连接自带读缓冲区，按 `Content-Length`、`chunked`
  或连接关闭分帧；
- HTTP/2：`h2` 客户端，一条连接承载多个交换，每个交换占用一个流槽位；
- TLS：`tokio-rustls` + `rustls`（aws-lc-rs 提供方），ALPN 列表由 [`HttpVersionPolicy`] 决定；
- 日志：全部通过 `tracing` 发出，库本身不安装 Subscriber，见 [`telemetry`]。

## 风险与考量（Trade-offs）
- 不做自动重试：[`TransportError::is_retryable`] 只给出建议，由上层决定；
- 地址逐个串行尝试，不实现 Happy Eyeballs。
"#]

mod client;
mod config;
mod connection;
mod connector;
mod error;
mod exchange;
mod io;
mod pool;
mod route;
pub mod telemetry;
mod util;

pub use client::HttpTransport;
pub use config::{
    ConfigError, HttpVersionPolicy, MAX_H2_WINDOW_SIZE, MIN_H2_WINDOW_SIZE, TransportConfig,
    TransportConfigBuilder,
};
pub use connection::{
    Connection, ConnectionId, ConnectionInfo, H1Connection, H2Connection, H2Lease,
    PooledConnection,
};
pub use error::{ErrorKind, PoolError, TransportError};
pub use exchange::{
    Exchange, ExchangeState, H1Exchange, H2BodySink, H2Exchange, RequestBodySink, Trailers,
};
pub use io::MaybeTlsStream;
pub use pool::{
    CleanupReport, CloseReason, ConnectionPool, H2Registry, PoolListener, PoolStats,
    RejectReason, Rejected, RoutePools, VALIDATION_THRESHOLD,
};
pub use route::{ProxyConfig, ProxyHop, Route, RouteError, Scheme};

pub use flare_stream::{CancelPolicy, DataStream, StreamError};
