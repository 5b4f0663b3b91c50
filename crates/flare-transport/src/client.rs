//! 顶层 `send`：路由解析 → 借出连接 → 开启交换 → 写请求体 → 等待响应头。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 上层 RPC 客户端只面对 `http::Request<DataStream>` 与 `http::Response<DataStream>`，
//!   连接池、协议差异与请求体写入策略都收敛在这里；
//!
//! ## 逻辑（How）
//! - HTTP/1.1，或 h2 且请求体可重放时，请求体在当前任务内写完，再等待响应头；
//! - h2 且请求体是单次消费的流时，把请求体写入端交给独立任务，与等待响应头并行，
//!   服务端可以边收边回；
//! - 到达响应头为止的整条路径受 `request_timeout` 约束。
//!
//! ## 契约（What）
//! - 任何错误在返回前都会先关闭交换；响应头到达前超时的交换以 `Errored` 原因驱逐连接；
//! - 响应的 extensions 中附带 [`Trailers`] 句柄，响应体读完后就绪；
//! - 响应体的 `Content-Type` 同步到返回的 [`DataStream`] 上。

use crate::config::TransportConfig;
use crate::error::{REQUEST, TransportError};
use crate::exchange::{Exchange, Trailers};
use crate::pool::ConnectionPool;
use crate::route::Route;
use crate::util::run_until;
use flare_stream::DataStream;
use http::{Request, Response, Uri, header, request};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 基于连接池的 HTTP 传输。
#[derive(Clone, Debug)]
pub struct HttpTransport {
    pool: ConnectionPool,
}

impl HttpTransport {
    /// 以 `config` 新建连接池并包装为传输。
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            pool: ConnectionPool::new(config)?,
        })
    }

    pub fn with_pool(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// 按配置中的代理与 `no_proxy` 规则解析路由。
    pub fn route_for(&self, uri: &Uri) -> Result<Route, TransportError> {
        Ok(Route::from_uri_with_proxy(uri, self.pool.config().proxy())?)
    }

    /// 借出连接并开启一次交换；请求头在返回前已经发出（HTTP/1.1）或流已打开（h2）。
    pub async fn new_exchange(
        &self,
        parts: &request::Parts,
        body_length: Option<u64>,
    ) -> Result<Exchange, TransportError> {
        let route = self.route_for(&parts.uri)?;
        let connection = self.pool.acquire(&route).await?;
        Exchange::open(&self.pool, connection, parts, body_length).await
    }

    pub async fn send(
        &self,
        request: Request<DataStream>,
    ) -> Result<Response<DataStream>, TransportError> {
        let (parts, body) = request.into_parts();
        let deadline = self
            .pool
            .config()
            .request_timeout()
            .map(|timeout| Instant::now() + timeout);
        let mut exchange = run_until(
            deadline,
            REQUEST,
            self.new_exchange(&parts, body.known_length()),
        )
        .await?;
        if let Err(error) = run_until(deadline, REQUEST, drive_to_head(&mut exchange, body)).await
        {
            return Err(exchange.abort(error));
        }

        let result = async {
            let status = exchange.response_status().await?;
            let headers = exchange.response_headers().await?.clone();
            let body = exchange.response_body().await?;
            Ok::<_, TransportError>((status, headers, body))
        }
        .await;
        let (status, headers, mut body) = match result {
            Ok(parts) => parts,
            Err(error) => {
                exchange.close();
                return Err(error);
            }
        };
        if let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            body = body.with_content_type(content_type);
        }

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.version_mut() = exchange.version();
        *response.headers_mut() = headers;
        response.extensions_mut().insert::<Trailers>(exchange.trailers());
        Ok(response)
    }

    /// 立即关闭连接池。
    pub fn close(&self) -> Result<(), TransportError> {
        self.pool.close_all()
    }

    /// 在 `grace` 内等待外借连接归还后关闭连接池。
    pub async fn shutdown(&self, grace: Duration) -> Result<(), TransportError> {
        self.pool.shutdown(grace).await
    }
}

/// 写出请求体并等待响应头；出错时交换仍留在调用方手中，由调用方终止。
async fn drive_to_head(exchange: &mut Exchange, body: DataStream) -> Result<(), TransportError> {
    if exchange.supports_bidirectional_streaming() && !body.is_replayable() {
        if let Some(mut sink) = exchange.take_request_body_sink() {
            tokio::spawn(async move {
                if let Err(error) = sink.write_all(&body).await {
                    debug!(stream_id = sink.stream_id(), %error, "streaming request body failed");
                }
            });
        }
    } else {
        exchange.write_request_body(&body).await?;
    }
    exchange.response_status().await.map(|_| ())
}
