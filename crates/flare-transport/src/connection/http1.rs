//! HTTP/1.1 连接与报文编解码。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 一条 HTTP/1.1 连接同一时刻只服务一个交换，连接对象本身就是编解码状态的载体：
//!   读缓冲区跨越“响应头 → 响应体 → 下一次复用”始终保留在连接上；
//! - 响应头使用 `httparse` 零拷贝解析，解析结果立即转为 `http::HeaderMap` 以脱离缓冲区借用。
//!
//! ## 逻辑（How）
//! - 请求：`encode_request_head` 生成请求行与头部，并决定请求体分帧
//!   （`Content-Length` 已知时直写，否则 `chunked`）；
//! - 响应：跳过 `1xx` 临时响应，按 RFC 9112 §6.3 选择 `Length` / `chunked` / 连接关闭三种分帧；
//! - 存活探测：以空操作 waker 轮询一次读取，`Pending` 表示对端无数据且未关闭。
//!
//! ## 契约（What）
//! - 响应头上限 64 KiB，超过即视为协议违例；
//! - `Connection: close`、HTTP/1.0 无 keep-alive、连接关闭分帧，都会把连接标记为不可复用；
//! - 任何读写错误都会把连接标记为不可复用。
//!
//! ## 风险（Trade-offs）
//! - 探测会消费 TLS 层的非应用数据（如 TLS 1.3 会话票据），这正是它优于直接 `peek`
//!   原始套接字的地方；代价是探测只能在连接空闲时调用。

use super::{ConnectionId, ConnectionInfo, PooledConnection};
use crate::error::{
    OperationKind, READ_BODY, READ_HEAD, TransportError, WRITE_BODY, WRITE_HEAD, map_io_error,
    protocol_error,
};
use crate::io::MaybeTlsStream;
use crate::route::Route;
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header, request};
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, trace};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// 独占的 HTTP/1.1 连接。
pub struct H1Connection {
    id: ConnectionId,
    route: Route,
    stream: MaybeTlsStream,
    read_buf: BytesMut,
    reusable: bool,
    closed: bool,
    permit: Option<OwnedSemaphorePermit>,
    created_at: Instant,
}

impl H1Connection {
    pub(crate) fn new(
        route: Route,
        stream: MaybeTlsStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            route,
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            reusable: true,
            closed: false,
            permit,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            route: self.route.clone(),
            version: Version::HTTP_11,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn is_alive(&self) -> bool {
        !self.closed && self.reusable
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// 连接停在报文边界上：没有残留的未解析输入。
    pub(crate) fn at_message_boundary(&self) -> bool {
        self.read_buf.is_empty()
    }

    pub(crate) fn mark_not_reusable(&mut self) {
        self.reusable = false;
    }

    pub(crate) async fn write_all(
        &mut self,
        buf: &[u8],
        kind: OperationKind,
    ) -> Result<(), TransportError> {
        if let Err(error) = self.stream.write_all(buf).await {
            self.reusable = false;
            return Err(map_io_error(kind, error));
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self, kind: OperationKind) -> Result<(), TransportError> {
        if let Err(error) = self.stream.flush().await {
            self.reusable = false;
            return Err(map_io_error(kind, error));
        }
        Ok(())
    }

    /// 读取最终响应头，跳过 `1xx` 临时响应。
    pub(crate) async fn read_response_head(
        &mut self,
        method: &Method,
    ) -> Result<(ResponseHead, BodyDecoder), TransportError> {
        loop {
            if let Some((consumed, head)) = parse_response_head(&self.read_buf, READ_HEAD)? {
                self.read_buf.advance(consumed);
                if head.status.is_informational() {
                    if head.status == StatusCode::SWITCHING_PROTOCOLS {
                        self.reusable = false;
                        return Err(protocol_error(
                            READ_HEAD,
                            "protocol upgrade is not supported",
                        ));
                    }
                    trace!(
                        connection_id = %self.id,
                        status = head.status.as_u16(),
                        "skipping interim response"
                    );
                    continue;
                }
                let decoder = BodyDecoder::for_response(method, &head)?;
                if !keeps_alive(&head) || decoder.is_close_delimited() {
                    debug!(connection_id = %self.id, route = %self.route, "connection will not be reused");
                    self.reusable = false;
                }
                return Ok((head, decoder));
            }
            if self.read_buf.len() >= MAX_HEAD_SIZE {
                self.reusable = false;
                return Err(protocol_error(READ_HEAD, "response head exceeds 64 KiB"));
            }
            self.fill_or_eof(READ_HEAD).await?;
        }
    }

    async fn fill(&mut self, kind: OperationKind) -> Result<usize, TransportError> {
        self.read_buf.reserve(READ_CHUNK);
        match self.stream.read_buf(&mut self.read_buf).await {
            Ok(read) => Ok(read),
            Err(error) => {
                self.reusable = false;
                Err(map_io_error(kind, error))
            }
        }
    }

    async fn fill_or_eof(&mut self, kind: OperationKind) -> Result<(), TransportError> {
        if self.fill(kind).await? == 0 {
            self.reusable = false;
            return Err(map_io_error(
                kind,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the message was complete",
                ),
            ));
        }
        Ok(())
    }

    async fn take_up_to(&mut self, limit: u64) -> Result<Bytes, TransportError> {
        if self.read_buf.is_empty() {
            self.fill_or_eof(READ_BODY).await?;
        }
        let len = usize::try_from(limit).map_or(self.read_buf.len(), |limit| {
            limit.min(self.read_buf.len())
        });
        Ok(self.read_buf.split_to(len).freeze())
    }
}

impl PooledConnection for H1Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_alive(&self) -> bool {
        H1Connection::is_alive(self)
    }

    fn probe(&mut self) -> bool {
        if !self.is_alive() || !self.read_buf.is_empty() {
            return false;
        }
        let mut scratch = [0u8; 8];
        let mut buf = ReadBuf::new(&mut scratch);
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(())) => {
                if buf.filled().is_empty() {
                    trace!(connection_id = %self.id, "peer closed the idle connection");
                } else {
                    debug!(connection_id = %self.id, "unsolicited bytes on an idle connection");
                }
                self.reusable = false;
                false
            }
            Poll::Ready(Err(error)) => {
                trace!(connection_id = %self.id, %error, "idle connection probe failed");
                self.reusable = false;
                false
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reusable = false;
        self.permit.take();
        match SockRef::from(self.stream.tcp()).shutdown(Shutdown::Both) {
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Drop for H1Connection {
    fn drop(&mut self) {
        let _ = PooledConnection::close(self);
    }
}

impl fmt::Debug for H1Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H1Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("reusable", &self.reusable)
            .field("closed", &self.closed)
            .finish()
    }
}

/// 已解析的响应头。
#[derive(Clone, Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// 从缓冲区解析一个完整响应头；数据不足时返回 `Ok(None)`。
pub(crate) fn parse_response_head(
    buf: &[u8],
    kind: OperationKind,
) -> Result<Option<(usize, ResponseHead)>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(error) => {
            return Err(protocol_error(kind, format!("malformed response head: {error}")));
        }
    };
    let Some(code) = response.code else {
        return Err(protocol_error(kind, "response head without status code"));
    };
    let status = StatusCode::from_u16(code)
        .map_err(|_| protocol_error(kind, format!("invalid status code {code}")))?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let headers = to_header_map(response.headers, kind)?;
    Ok(Some((
        consumed,
        ResponseHead {
            status,
            version,
            headers,
        },
    )))
}

fn to_header_map(
    raw: &[httparse::Header<'_>],
    kind: OperationKind,
) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for entry in raw {
        let name = HeaderName::from_bytes(entry.name.as_bytes())
            .map_err(|_| protocol_error(kind, format!("invalid header name `{}`", entry.name)))?;
        let value = HeaderValue::from_bytes(entry.value)
            .map_err(|_| protocol_error(kind, format!("invalid value for header `{name}`")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn keeps_alive(head: &ResponseHead) -> bool {
    if has_token(&head.headers, header::CONNECTION, "close") {
        return false;
    }
    head.version != Version::HTTP_10 || has_token(&head.headers, header::CONNECTION, "keep-alive")
}

/// 请求体的分帧方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestFraming {
    Empty,
    Length(u64),
    Chunked,
}

fn method_expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// 编码请求行与头部，返回请求体分帧。
///
/// 调用方给出的 `Content-Length` / `Transfer-Encoding` 会被忽略，分帧只由
/// `body_length` 决定；经明文代理转发时使用绝对形式的请求目标。
pub(crate) fn encode_request_head(
    parts: &request::Parts,
    route: &Route,
    body_length: Option<u64>,
    dst: &mut BytesMut,
) -> RequestFraming {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
    let forwarded = route.proxy().filter(|_| !route.is_secure());

    dst.extend_from_slice(parts.method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    if forwarded.is_some() {
        dst.extend_from_slice(route.scheme().as_str().as_bytes());
        dst.extend_from_slice(b"://");
        dst.extend_from_slice(route.authority().as_bytes());
    }
    if path.starts_with('?') {
        dst.extend_from_slice(b"/");
    }
    dst.extend_from_slice(path.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    if !parts.headers.contains_key(header::HOST) {
        put_header(dst, header::HOST.as_str(), route.authority().as_bytes());
    }
    if let Some(hop) = forwarded
        && let Some(authorization) = hop.authorization()
        && !parts.headers.contains_key(header::PROXY_AUTHORIZATION)
    {
        put_header(
            dst,
            header::PROXY_AUTHORIZATION.as_str(),
            authorization.as_bytes(),
        );
    }
    for (name, value) in &parts.headers {
        if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        put_header(dst, name.as_str(), value.as_bytes());
    }

    let framing = match body_length {
        Some(0) if !method_expects_body(&parts.method) => RequestFraming::Empty,
        Some(length) => RequestFraming::Length(length),
        None => RequestFraming::Chunked,
    };
    match framing {
        RequestFraming::Empty => {}
        RequestFraming::Length(length) => {
            put_header(
                dst,
                header::CONTENT_LENGTH.as_str(),
                length.to_string().as_bytes(),
            );
        }
        RequestFraming::Chunked => {
            put_header(dst, header::TRANSFER_ENCODING.as_str(), b"chunked");
        }
    }
    dst.extend_from_slice(b"\r\n");
    framing
}

fn put_header(dst: &mut BytesMut, name: &str, value: &[u8]) {
    dst.extend_from_slice(name.as_bytes());
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value);
    dst.extend_from_slice(b"\r\n");
}

/// 按请求头约定的分帧写出请求体。
#[derive(Debug)]
pub(crate) struct RequestBodyEncoder {
    framing: RequestFraming,
    written: u64,
    finished: bool,
}

impl RequestBodyEncoder {
    pub(crate) fn new(framing: RequestFraming) -> Self {
        Self {
            framing,
            written: 0,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) async fn write(
        &mut self,
        connection: &mut H1Connection,
        chunk: &[u8],
    ) -> Result<(), TransportError> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.finished {
            return Err(protocol_error(WRITE_BODY, "request body already finished"));
        }
        match self.framing {
            RequestFraming::Empty => {
                return Err(protocol_error(WRITE_BODY, "request declared an empty body"));
            }
            RequestFraming::Length(length) => {
                let total = self.written + chunk.len() as u64;
                if total > length {
                    connection.mark_not_reusable();
                    return Err(protocol_error(
                        WRITE_BODY,
                        format!("request body exceeds declared content-length {length}"),
                    ));
                }
                connection.write_all(chunk, WRITE_BODY).await?;
            }
            RequestFraming::Chunked => {
                let mut framed = BytesMut::with_capacity(chunk.len() + 20);
                framed.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                framed.extend_from_slice(chunk);
                framed.extend_from_slice(b"\r\n");
                connection.write_all(&framed, WRITE_BODY).await?;
            }
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// 写出结束标记并刷新；已结束时为空操作。
    pub(crate) async fn finish(
        &mut self,
        connection: &mut H1Connection,
    ) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        match self.framing {
            RequestFraming::Length(length) if self.written != length => {
                connection.mark_not_reusable();
                return Err(protocol_error(
                    WRITE_BODY,
                    format!(
                        "request body ended after {} of {length} declared bytes",
                        self.written
                    ),
                ));
            }
            RequestFraming::Chunked => {
                connection.write_all(b"0\r\n\r\n", WRITE_BODY).await?;
            }
            _ => {}
        }
        connection.flush(WRITE_BODY).await
    }
}

/// 写出请求头并刷新。
pub(crate) async fn write_request_head(
    connection: &mut H1Connection,
    parts: &request::Parts,
    body_length: Option<u64>,
) -> Result<RequestBodyEncoder, TransportError> {
    let mut head = BytesMut::with_capacity(512);
    let framing = encode_request_head(parts, &connection.route, body_length, &mut head);
    connection.write_all(&head, WRITE_HEAD).await?;
    connection.flush(WRITE_HEAD).await?;
    trace!(
        connection_id = %connection.id,
        method = %parts.method,
        ?framing,
        "request head written"
    );
    Ok(RequestBodyEncoder::new(framing))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    CloseDelimited,
    Done,
}

/// 响应体解码器，驱动 [`H1Connection`] 的读缓冲区。
#[derive(Debug)]
pub(crate) struct BodyDecoder {
    state: BodyState,
    known_length: Option<u64>,
    trailers: Option<HeaderMap>,
}

impl BodyDecoder {
    pub(crate) fn for_response(method: &Method, head: &ResponseHead) -> Result<Self, TransportError> {
        if *method == Method::HEAD
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::with_state(BodyState::Done, Some(0)));
        }
        if head.headers.contains_key(header::TRANSFER_ENCODING) {
            let last = head
                .headers
                .get_all(header::TRANSFER_ENCODING)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .filter(|coding| !coding.is_empty())
                .last();
            return Ok(match last {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => {
                    Self::with_state(BodyState::ChunkSize, None)
                }
                _ => Self::with_state(BodyState::CloseDelimited, None),
            });
        }
        let mut length = None;
        for value in head.headers.get_all(header::CONTENT_LENGTH) {
            let text = value
                .to_str()
                .map_err(|_| protocol_error(READ_HEAD, "content-length is not ASCII"))?;
            for item in text.split(',') {
                let parsed: u64 = item.trim().parse().map_err(|_| {
                    protocol_error(READ_HEAD, format!("invalid content-length `{text}`"))
                })?;
                match length {
                    Some(existing) if existing != parsed => {
                        return Err(protocol_error(
                            READ_HEAD,
                            "conflicting content-length values",
                        ));
                    }
                    _ => length = Some(parsed),
                }
            }
        }
        Ok(match length {
            Some(0) => Self::with_state(BodyState::Done, Some(0)),
            Some(length) => Self::with_state(BodyState::Length(length), Some(length)),
            None => Self::with_state(BodyState::CloseDelimited, None),
        })
    }

    fn with_state(state: BodyState, known_length: Option<u64>) -> Self {
        Self {
            state,
            known_length,
            trailers: None,
        }
    }

    pub(crate) fn known_length(&self) -> Option<u64> {
        self.known_length
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == BodyState::Done
    }

    pub(crate) fn is_close_delimited(&self) -> bool {
        self.state == BodyState::CloseDelimited
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    /// 读取下一段响应体；返回 `Ok(None)` 表示响应体已结束。
    pub(crate) async fn next_chunk(
        &mut self,
        connection: &mut H1Connection,
    ) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.state {
                BodyState::Done => return Ok(None),
                BodyState::Length(remaining) => {
                    let chunk = connection.take_up_to(remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        BodyState::Done
                    } else {
                        BodyState::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::CloseDelimited => {
                    if connection.read_buf.is_empty() && connection.fill(READ_BODY).await? == 0 {
                        self.state = BodyState::Done;
                        return Ok(None);
                    }
                    return Ok(Some(connection.read_buf.split().freeze()));
                }
                BodyState::ChunkSize => {
                    let Some(line_end) = find_crlf(&connection.read_buf) else {
                        if connection.read_buf.len() > MAX_CHUNK_LINE {
                            return Err(protocol_error(READ_BODY, "chunk size line too long"));
                        }
                        connection.fill_or_eof(READ_BODY).await?;
                        continue;
                    };
                    let size = parse_chunk_size(&connection.read_buf[..line_end])?;
                    connection.read_buf.advance(line_end + 2);
                    self.state = if size == 0 {
                        BodyState::Trailers
                    } else {
                        BodyState::ChunkData(size)
                    };
                }
                BodyState::ChunkData(remaining) => {
                    let chunk = connection.take_up_to(remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        BodyState::ChunkDataEnd
                    } else {
                        BodyState::ChunkData(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::ChunkDataEnd => {
                    if connection.read_buf.len() < 2 {
                        connection.fill_or_eof(READ_BODY).await?;
                        continue;
                    }
                    if &connection.read_buf[..2] != b"\r\n" {
                        return Err(protocol_error(READ_BODY, "chunk data not followed by CRLF"));
                    }
                    connection.read_buf.advance(2);
                    self.state = BodyState::ChunkSize;
                }
                BodyState::Trailers => {
                    match parse_trailers(&connection.read_buf)? {
                        Some((consumed, trailers)) => {
                            connection.read_buf.advance(consumed);
                            if !trailers.is_empty() {
                                self.trailers = Some(trailers);
                            }
                            self.state = BodyState::Done;
                            return Ok(None);
                        }
                        None if connection.read_buf.len() >= MAX_HEAD_SIZE => {
                            return Err(protocol_error(READ_BODY, "trailer section exceeds 64 KiB"));
                        }
                        None => connection.fill_or_eof(READ_BODY).await?,
                    }
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, TransportError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| protocol_error(READ_BODY, "chunk size line is not ASCII"))?;
    let digits = line.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() || digits.len() > 16 {
        return Err(protocol_error(
            READ_BODY,
            format!("invalid chunk size `{line}`"),
        ));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|_| protocol_error(READ_BODY, format!("invalid chunk size `{line}`")))
}

fn parse_trailers(buf: &[u8]) -> Result<Option<(usize, HeaderMap)>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(buf, &mut headers) {
        Ok(httparse::Status::Complete((consumed, parsed))) => {
            Ok(Some((consumed, to_header_map(parsed, READ_BODY)?)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(error) => Err(protocol_error(
            READ_BODY,
            format!("malformed trailer section: {error}"),
        )),
    }
}
