//! 传输层错误映射模块。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把 DNS/TCP/TLS/h2/HTTP 解析等底层库的错误统一映射到五类 [`ErrorKind`]，调用方据此决定
//!   重试、驱逐连接或直接失败，无需理解底层库细节；
//! - 为每类操作提供稳定错误码（`flare.transport.tcp.connect_failed` 等），便于日志检索与告警。
//!
//! ## 逻辑（How）
//! - `OperationKind` 描述一类操作的错误码与默认文案；
//! - `map_io_error`/`connect_error`/`protocol_error`/`h2_error` 生成带分类的 [`TransportError`]；
//! - `timeout_error`/`cancelled_error` 使用统一的超时与取消错误码。
//!
//! ## 契约（What）
//! - [`TransportError::kind`] 永远返回五类之一；
//! - [`TransportError::evicts_connection`] 为真时，连接必须关闭而非放回连接池。

use crate::route::RouteError;
use flare_stream::StreamError;
use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "flare.transport.dns.resolve_failed",
    message: "dns resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "flare.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "flare.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const PROXY_TUNNEL: OperationKind = OperationKind {
    code: "flare.transport.proxy.tunnel_failed",
    message: "proxy CONNECT",
};
pub(crate) const TLS_HANDSHAKE: OperationKind = OperationKind {
    code: "flare.transport.tls.handshake_failed",
    message: "tls handshake",
};
pub(crate) const ALPN: OperationKind = OperationKind {
    code: "flare.transport.tls.alpn_mismatch",
    message: "alpn negotiation",
};
pub(crate) const H2_HANDSHAKE: OperationKind = OperationKind {
    code: "flare.transport.h2.handshake_failed",
    message: "h2 handshake",
};
pub(crate) const ACQUIRE: OperationKind = OperationKind {
    code: "flare.transport.pool.acquire_failed",
    message: "connection acquire",
};
pub(crate) const WRITE_HEAD: OperationKind = OperationKind {
    code: "flare.transport.h1.write_head_failed",
    message: "h1 write request head",
};
pub(crate) const WRITE_BODY: OperationKind = OperationKind {
    code: "flare.transport.h1.write_body_failed",
    message: "h1 write request body",
};
pub(crate) const READ_HEAD: OperationKind = OperationKind {
    code: "flare.transport.h1.read_head_failed",
    message: "h1 read response head",
};
pub(crate) const READ_BODY: OperationKind = OperationKind {
    code: "flare.transport.h1.read_body_failed",
    message: "h1 read response body",
};
pub(crate) const H2_SEND: OperationKind = OperationKind {
    code: "flare.transport.h2.send_failed",
    message: "h2 send",
};
pub(crate) const H2_RECV: OperationKind = OperationKind {
    code: "flare.transport.h2.recv_failed",
    message: "h2 receive",
};
pub(crate) const REQUEST: OperationKind = OperationKind {
    code: "flare.transport.request_failed",
    message: "request",
};

const CANCEL_CODE: &str = "flare.transport.cancelled";
const TIMEOUT_CODE: &str = "flare.transport.timeout";

/// 传输失败的五种类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// DNS、TCP、TLS 或代理握手失败。
    ConnectFailure,
    /// 交换进行中的 IO 错误。
    TransportFailure,
    /// 报文头或分帧不合法、h2 协议错误。
    ProtocolViolation,
    /// 建连、TLS、获取连接、请求或吞吐超时。
    Timeout,
    /// 消费方取消或连接池关闭。
    Cancellation,
}

impl ErrorKind {
    /// 该类错误是否意味着底层连接已不可信。
    pub const fn evicts_connection(self) -> bool {
        matches!(self, Self::ConnectFailure | Self::ProtocolViolation)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectFailure => "connect_failure",
            Self::TransportFailure => "transport_failure",
            Self::ProtocolViolation => "protocol_violation",
            Self::Timeout => "timeout",
            Self::Cancellation => "cancellation",
        }
    }
}

/// 连接池自身的失败。
#[derive(Debug, Error)]
pub enum PoolError {
    /// 同一路由以不同的 `max_connections` 再次建池。
    #[error("route pool for `{route}` already exists with max_connections={existing}, requested {requested}")]
    SizeMismatch {
        route: String,
        existing: usize,
        requested: usize,
    },
    /// 在 `acquire_timeout` 内没有拿到全局连接许可。
    #[error("connection pool exhausted: {limit} connections in use (waited {waited:?})")]
    Exhausted { limit: usize, waited: Duration },
    /// 连接池已关闭或正在关闭。
    #[error("connection pool is closed")]
    Closed,
}

impl PoolError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SizeMismatch { .. } => "flare.transport.pool.size_mismatch",
            Self::Exhausted { .. } => "flare.transport.pool.exhausted",
            Self::Closed => "flare.transport.pool.closed",
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SizeMismatch { .. } => ErrorKind::ConnectFailure,
            Self::Exhausted { .. } => ErrorKind::Timeout,
            Self::Closed => ErrorKind::Cancellation,
        }
    }
}

/// 传输层统一错误。
///
/// # 教案式说明
/// - **意图 (Why)**：一个枚举覆盖整条 `send` 路径，调用方只需匹配 [`ErrorKind`]；
/// - **契约 (What)**：每个变体都携带稳定错误码（见 [`code`](Self::code)）与可读文案；
///   `Cleanup` 汇总关闭连接时累积的全部 IO 错误，不会因首个失败而中断清理；
/// - **风险 (Trade-offs)**：`Protocol` 仅保存文字描述，丢弃了 `httparse` 的原始错误值，
///   换取变体可 `Send + Sync` 且不泄露解析器细节。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{operation}: {source}")]
    Connect {
        code: &'static str,
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{operation}: {source}")]
    Io {
        code: &'static str,
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{operation}: {detail}")]
    Protocol {
        code: &'static str,
        operation: &'static str,
        detail: Cow<'static, str>,
    },
    #[error("{operation}: {source}")]
    H2 {
        code: &'static str,
        operation: &'static str,
        #[source]
        source: h2::Error,
    },
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },
    #[error("invalid route: {0}")]
    Route(#[from] RouteError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("body stream failed: {0}")]
    Body(#[from] StreamError),
    #[error("invalid tls configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("errors closing connections ({} in total)", errors.len())]
    Cleanup { errors: Vec<io::Error> },
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } | Self::Route(_) | Self::Tls(_) => ErrorKind::ConnectFailure,
            Self::Io { .. } | Self::Cleanup { .. } => ErrorKind::TransportFailure,
            Self::Protocol { .. } => ErrorKind::ProtocolViolation,
            Self::H2 { source, .. } => categorize_h2_error(source),
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
            Self::Pool(error) => error.kind(),
            Self::Body(StreamError::Cancelled) => ErrorKind::Cancellation,
            Self::Body(_) => ErrorKind::TransportFailure,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect { code, .. }
            | Self::Io { code, .. }
            | Self::Protocol { code, .. }
            | Self::H2 { code, .. } => *code,
            Self::Timeout { .. } => TIMEOUT_CODE,
            Self::Cancelled { .. } => CANCEL_CODE,
            Self::Route(_) => "flare.transport.route.invalid",
            Self::Pool(error) => error.code(),
            Self::Body(_) => "flare.transport.body.failed",
            Self::Tls(_) => "flare.transport.tls.config_invalid",
            Self::Cleanup { .. } => "flare.transport.pool.cleanup_failed",
        }
    }

    /// 出现该错误后连接是否必须关闭。
    ///
    /// h2 的良性流重置（`CANCEL`、`REFUSED_STREAM` 等）只影响单个流；
    /// 连接级错误（`GOAWAY`、IO）以及归类为协议违规的帧错误都需要驱逐。
    pub fn evicts_connection(&self) -> bool {
        match self {
            Self::H2 { source, .. } => {
                source.is_io()
                    || source.is_go_away()
                    || categorize_h2_error(source) == ErrorKind::ProtocolViolation
            }
            Self::Timeout { .. } => true,
            other => other.kind().evicts_connection(),
        }
    }

    /// 依据底层 IO 错误判断是否值得在新连接上重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { source, .. } | Self::Io { source, .. } => is_retryable_io(source),
            Self::H2 { source, .. } => source.reason() == Some(h2::Reason::REFUSED_STREAM),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// 将 IO 错误映射为交换阶段的传输失败。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError::Io {
        code: kind.code,
        operation: kind.message,
        source: error,
    }
}

/// 将 IO 错误映射为建连失败。
pub(crate) fn connect_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError::Connect {
        code: kind.code,
        operation: kind.message,
        source: error,
    }
}

pub(crate) fn protocol_error(
    kind: OperationKind,
    detail: impl Into<Cow<'static, str>>,
) -> TransportError {
    TransportError::Protocol {
        code: kind.code,
        operation: kind.message,
        detail: detail.into(),
    }
}

pub(crate) fn h2_error(kind: OperationKind, error: h2::Error) -> TransportError {
    TransportError::H2 {
        code: kind.code,
        operation: kind.message,
        source: error,
    }
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> TransportError {
    TransportError::Timeout {
        operation: kind.message,
    }
}

/// 构造取消错误。
pub(crate) fn cancelled_error(kind: OperationKind) -> TransportError {
    TransportError::Cancelled {
        operation: kind.message,
    }
}

fn categorize_h2_error(error: &h2::Error) -> ErrorKind {
    if error.is_io() {
        return ErrorKind::TransportFailure;
    }
    match error.reason() {
        Some(
            h2::Reason::PROTOCOL_ERROR
            | h2::Reason::COMPRESSION_ERROR
            | h2::Reason::FRAME_SIZE_ERROR
            | h2::Reason::FLOW_CONTROL_ERROR
            | h2::Reason::STREAM_CLOSED,
        ) => ErrorKind::ProtocolViolation,
        Some(h2::Reason::CANCEL) if !error.is_remote() => ErrorKind::Cancellation,
        _ => ErrorKind::TransportFailure,
    }
}

fn is_retryable_io(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::UnexpectedEof
    )
}
