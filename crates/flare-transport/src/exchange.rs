//! 交换：绑定在一条连接（或一个 h2 流）上的一次请求/响应。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 请求体写入与响应读取是两个独立的方向：HTTP/1.1 必须先写完再读，h2 则可以把
//!   请求体写入端交给另一个任务，实现真正的双向流式；
//! - 响应体一律经 [`BackpressureBridge`] 交给调用方，读取循环运行在独立任务上，
//!   只在消费者声明需求后才从连接读取数据。
//!
//! ## 逻辑（How）
//! - [`Exchange`] 是按协议划分的标签枚举，建连时的 ALPN 结果决定变体；
//! - 响应体读取任务结束时根据结果决定连接去留：完整读完归还，消费者放弃则驱逐
//!   （HTTP/1.1）或重置流（h2），读取失败则按错误类别驱逐；
//! - 交换在任何阶段被丢弃（包括请求超时导致的 Future 丢弃）都会在析构时完成同样的清理。
//!
//! ## 契约（What）
//! - 任何失败都会把交换置为 [`ExchangeState::Failed`] 并立即处理连接，仍在等待的另一方向
//!   随之得到错误，而不会无限挂起；
//! - `response_body` 只能成功调用一次，第二次返回 `AlreadyConsumed`；
//! - `close` 幂等。
//!
//! ## 风险（Trade-offs）
//! - h2 响应体在消费者取消后立即重置流（`CloseImmediately`），不做吞吐：流级重置不影响
//!   连接上的其它交换，吞吐反而会占用连接窗口。

use crate::connection::http1::{BodyDecoder, RequestBodyEncoder, ResponseHead, write_request_head};
use crate::connection::{Connection, ConnectionId, H1Connection, H2Lease};
use crate::error::{
    H2_RECV, H2_SEND, READ_BODY, READ_HEAD, TransportError, WRITE_BODY, cancelled_error, h2_error,
    map_io_error, protocol_error,
};
use crate::pool::ConnectionPool;
use crate::route::Route;
use bytes::Bytes;
use flare_stream::{BackpressureBridge, BridgeProducer, CancelPolicy, DataStream, StreamError};
use futures_util::StreamExt;
use h2::client::ResponseFuture;
use h2::{Reason, RecvStream, SendStream};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version, header, request, response};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// 交换所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Open,
    ResponseHeadersReceived,
    Closed,
    Failed,
}

#[derive(Clone, Debug)]
enum TrailerSlot {
    Pending,
    Ready(Option<HeaderMap>),
}

/// 响应尾部字段句柄，在响应体结束后就绪。
///
/// `HttpTransport::send` 把它放在响应的 extensions 中。响应体未读完就被放弃时，
/// 尾部字段视为不存在。
#[derive(Clone, Debug)]
pub struct Trailers {
    slot: watch::Receiver<TrailerSlot>,
}

impl Trailers {
    /// 等待响应体结束并返回尾部字段。
    pub async fn wait(&self) -> Option<HeaderMap> {
        let mut slot = self.slot.clone();
        let ready = slot
            .wait_for(|slot| matches!(slot, TrailerSlot::Ready(_)))
            .await;
        match ready.as_deref() {
            Ok(TrailerSlot::Ready(trailers)) => trailers.clone(),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.slot.borrow(), TrailerSlot::Ready(_))
    }

    /// 立即读取；尚未就绪时返回 `None`。
    pub fn get(&self) -> Option<HeaderMap> {
        match &*self.slot.borrow() {
            TrailerSlot::Ready(trailers) => trailers.clone(),
            TrailerSlot::Pending => None,
        }
    }
}

struct TrailerPublisher {
    slot: watch::Sender<TrailerSlot>,
}

impl TrailerPublisher {
    fn publish(&self, trailers: Option<HeaderMap>) {
        self.slot.send_replace(TrailerSlot::Ready(trailers));
    }
}

fn trailer_channel() -> (TrailerPublisher, Trailers) {
    let (slot, receiver) = watch::channel(TrailerSlot::Pending);
    (TrailerPublisher { slot }, Trailers { slot: receiver })
}

enum PumpOutcome {
    Complete,
    Aborted,
    Failed(TransportError),
}

/// 一次请求/响应交换。
pub enum Exchange {
    Http1(H1Exchange),
    Http2(H2Exchange),
}

impl Exchange {
    /// 在已借出的连接上开启交换；失败时连接被驱逐或归还，不会泄漏。
    pub async fn open(
        pool: &ConnectionPool,
        connection: Connection,
        parts: &request::Parts,
        body_length: Option<u64>,
    ) -> Result<Self, TransportError> {
        match connection {
            Connection::Http1(connection) => {
                H1Exchange::open(pool, connection, parts, body_length)
                    .await
                    .map(Self::Http1)
            }
            Connection::Http2(lease) => H2Exchange::open(pool, lease, parts, body_length)
                .await
                .map(Self::Http2),
        }
    }

    /// 借用式请求体写入端。
    pub fn request_body_sink(&mut self) -> RequestBodySink<'_> {
        RequestBodySink { exchange: self }
    }

    /// 取走可移动到其它任务的请求体写入端；只有 h2 交换支持。
    pub fn take_request_body_sink(&mut self) -> Option<H2BodySink> {
        match self {
            Self::Http1(_) => None,
            Self::Http2(exchange) => exchange.sink.take(),
        }
    }

    /// 写出完整请求体并结束请求。
    pub async fn write_request_body(&mut self, body: &DataStream) -> Result<(), TransportError> {
        match self {
            Self::Http1(exchange) => exchange.write_body(body).await,
            Self::Http2(exchange) => exchange.write_body(body).await,
        }
    }

    pub async fn response_status(&mut self) -> Result<StatusCode, TransportError> {
        match self {
            Self::Http1(exchange) => exchange.ensure_head().await.map(|head| head.status),
            Self::Http2(exchange) => exchange.ensure_head().await.map(|head| head.status),
        }
    }

    pub async fn response_headers(&mut self) -> Result<&HeaderMap, TransportError> {
        match self {
            Self::Http1(exchange) => exchange.ensure_head().await.map(|head| &head.headers),
            Self::Http2(exchange) => exchange.ensure_head().await.map(|head| &head.headers),
        }
    }

    /// 响应体；完整读完后连接自动归还。
    pub async fn response_body(&mut self) -> Result<DataStream, TransportError> {
        match self {
            Self::Http1(exchange) => exchange.response_body().await,
            Self::Http2(exchange) => exchange.response_body().await,
        }
    }

    pub fn trailers(&self) -> Trailers {
        match self {
            Self::Http1(exchange) => exchange.trailers.clone(),
            Self::Http2(exchange) => exchange.trailers.clone(),
        }
    }

    pub fn supports_bidirectional_streaming(&self) -> bool {
        matches!(self, Self::Http2(_))
    }

    pub fn state(&self) -> ExchangeState {
        match self {
            Self::Http1(exchange) => exchange.state,
            Self::Http2(exchange) => exchange.state,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Self::Http1(exchange) => exchange.connection_id,
            Self::Http2(exchange) => exchange.connection_id,
        }
    }

    /// 响应头到达后返回响应的协议版本，之前返回连接的协议版本。
    pub fn version(&self) -> Version {
        match self {
            Self::Http1(exchange) => exchange
                .head
                .as_ref()
                .map_or(Version::HTTP_11, |head| head.version),
            Self::Http2(_) => Version::HTTP_2,
        }
    }

    /// 结束交换；未完成的一侧被中止。
    pub fn close(&mut self) {
        match self {
            Self::Http1(exchange) => exchange.close(),
            Self::Http2(exchange) => exchange.close(),
        }
    }

    /// 以 `error` 终止交换：连接按失败处理，关闭原因记为 [`CloseReason::Errored`]。
    ///
    /// h2 交换只有在 `error` 需要驱逐连接时才关闭整条连接，否则只重置本流。
    ///
    /// [`CloseReason::Errored`]: crate::CloseReason::Errored
    pub fn abort(&mut self, error: TransportError) -> TransportError {
        let error = match self {
            Self::Http1(exchange) => exchange.fail(error),
            Self::Http2(exchange) => exchange.fail(error),
        };
        self.close();
        error
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        match self {
            Self::Http1(exchange) => exchange.write_chunk(&chunk).await,
            Self::Http2(exchange) => exchange.write_chunk(chunk).await,
        }
    }

    async fn finish_request_body(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Http1(exchange) => exchange.finish_body().await,
            Self::Http2(exchange) => exchange.finish_body(),
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("connection_id", &self.connection_id())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

/// 借用交换的请求体写入端；`close` 发出请求体结束标记。
pub struct RequestBodySink<'a> {
    exchange: &'a mut Exchange,
}

impl RequestBodySink<'_> {
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        self.exchange.write_chunk(chunk).await
    }

    pub async fn close(self) -> Result<(), TransportError> {
        self.exchange.finish_request_body().await
    }
}

/// HTTP/1.1 交换：独占整条连接。
pub struct H1Exchange {
    pool: ConnectionPool,
    connection: Option<H1Connection>,
    connection_id: ConnectionId,
    method: Method,
    encoder: RequestBodyEncoder,
    head: Option<ResponseHead>,
    decoder: Option<BodyDecoder>,
    body_taken: bool,
    response_complete: bool,
    state: ExchangeState,
    trailers: Trailers,
    publisher: Option<TrailerPublisher>,
}

impl H1Exchange {
    async fn open(
        pool: &ConnectionPool,
        mut connection: H1Connection,
        parts: &request::Parts,
        body_length: Option<u64>,
    ) -> Result<Self, TransportError> {
        let encoder = match write_request_head(&mut connection, parts, body_length).await {
            Ok(encoder) => encoder,
            Err(error) => {
                pool.evict(Connection::Http1(connection), true);
                return Err(error);
            }
        };
        let (publisher, trailers) = trailer_channel();
        Ok(Self {
            pool: pool.clone(),
            connection_id: connection.id(),
            connection: Some(connection),
            method: parts.method.clone(),
            encoder,
            head: None,
            decoder: None,
            body_taken: false,
            response_complete: false,
            state: ExchangeState::Open,
            trailers,
            publisher: Some(publisher),
        })
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(cancelled_error(WRITE_BODY));
        };
        let result = self.encoder.write(connection, chunk).await;
        result.map_err(|error| self.fail(error))
    }

    async fn finish_body(&mut self) -> Result<(), TransportError> {
        if self.encoder.is_finished() {
            return Ok(());
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(cancelled_error(WRITE_BODY));
        };
        let result = self.encoder.finish(connection).await;
        result.map_err(|error| self.fail(error))
    }

    async fn write_body(&mut self, body: &DataStream) -> Result<(), TransportError> {
        let mut chunks = match body.as_stream() {
            Ok(chunks) => chunks,
            Err(error) => return Err(self.fail(error.into())),
        };
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => self.write_chunk(&chunk).await?,
                Err(error) => return Err(self.fail(error.into())),
            }
        }
        self.finish_body().await
    }

    /// 请求体必须先完整写出，响应头才可读。
    async fn ensure_head(&mut self) -> Result<&ResponseHead, TransportError> {
        if self.head.is_none() {
            self.finish_body().await?;
            let Some(connection) = self.connection.as_mut() else {
                return Err(cancelled_error(READ_HEAD));
            };
            let result = connection.read_response_head(&self.method).await;
            match result {
                Ok((head, decoder)) => {
                    self.response_complete = decoder.is_done();
                    self.head = Some(head);
                    self.decoder = Some(decoder);
                    self.state = ExchangeState::ResponseHeadersReceived;
                }
                Err(error) => return Err(self.fail(error)),
            }
        }
        self.head.as_ref().ok_or_else(|| cancelled_error(READ_HEAD))
    }

    async fn response_body(&mut self) -> Result<DataStream, TransportError> {
        self.ensure_head().await?;
        if self.body_taken {
            return Err(StreamError::AlreadyConsumed.into());
        }
        self.body_taken = true;
        let Some(decoder) = self.decoder.take() else {
            return Err(cancelled_error(READ_BODY));
        };
        let publisher = self.publisher.take();
        if decoder.is_done() {
            if let Some(publisher) = publisher {
                publisher.publish(None);
            }
            self.settle();
            return Ok(DataStream::empty());
        }
        let Some(connection) = self.connection.take() else {
            return Err(cancelled_error(READ_BODY));
        };
        let known_length = decoder.known_length();
        let bridge = BackpressureBridge::new(self.pool.config().bridge_config());
        let (producer, consumer) = bridge.open();
        tokio::spawn(pump_h1(
            self.pool.clone(),
            connection,
            decoder,
            producer,
            publisher,
        ));
        Ok(DataStream::from_bridge(consumer, known_length))
    }

    fn fail(&mut self, error: TransportError) -> TransportError {
        self.state = ExchangeState::Failed;
        self.publisher = None;
        if let Some(connection) = self.connection.take() {
            debug!(connection_id = %self.connection_id, %error, "http/1.1 exchange failed");
            self.pool.evict(Connection::Http1(connection), true);
        }
        error
    }

    /// 报文完整结束时归还连接，否则连接停在报文中间，只能驱逐。
    fn settle(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.encoder.is_finished() && self.response_complete {
            self.pool.release(Connection::Http1(connection));
        } else {
            trace!(connection_id = %self.connection_id, "exchange abandoned mid-message");
            self.pool.evict(Connection::Http1(connection), false);
        }
    }

    fn close(&mut self) {
        self.settle();
        self.publisher = None;
        if self.state != ExchangeState::Failed {
            self.state = ExchangeState::Closed;
        }
    }
}

impl Drop for H1Exchange {
    fn drop(&mut self) {
        self.settle();
    }
}

async fn pump_h1(
    pool: ConnectionPool,
    mut connection: H1Connection,
    mut decoder: BodyDecoder,
    mut producer: BridgeProducer,
    publisher: Option<TrailerPublisher>,
) {
    let outcome = loop {
        if producer.demand().await.is_err() {
            break PumpOutcome::Aborted;
        }
        let next = tokio::select! {
            biased;
            _ = producer.aborted() => break PumpOutcome::Aborted,
            next = decoder.next_chunk(&mut connection) => next,
        };
        match next {
            Ok(Some(chunk)) => {
                if producer.on_chunk(chunk).await.is_err() {
                    break PumpOutcome::Aborted;
                }
            }
            Ok(None) => break PumpOutcome::Complete,
            Err(error) => break PumpOutcome::Failed(error),
        }
    };
    let id = connection.id();
    match outcome {
        PumpOutcome::Complete => {
            if let Some(publisher) = &publisher {
                publisher.publish(decoder.take_trailers());
            }
            let _ = producer.on_complete(&[]).await;
            if !connection.at_message_boundary() {
                debug!(connection_id = %id, "unexpected bytes after the response body");
                connection.mark_not_reusable();
            }
            trace!(connection_id = %id, "response body complete");
            pool.release(Connection::Http1(connection));
        }
        PumpOutcome::Aborted => {
            debug!(connection_id = %id, "response body abandoned mid-stream");
            pool.evict(Connection::Http1(connection), false);
        }
        PumpOutcome::Failed(error) => {
            debug!(connection_id = %id, %error, "reading the response body failed");
            let _ = producer.on_error(StreamError::upstream(error)).await;
            pool.evict(Connection::Http1(connection), true);
        }
    }
}

/// 可移动的 h2 请求体写入端。
///
/// 写入遵守对端流控窗口：每次只发送已获授予的容量。未调用 `close` 就被丢弃时，
/// 流以 `CANCEL` 重置。
pub struct H2BodySink {
    stream: Arc<Mutex<SendStream<Bytes>>>,
    stream_id: u32,
    finished: bool,
}

impl H2BodySink {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn write(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        if self.finished {
            return Err(protocol_error(H2_SEND, "request body already finished"));
        }
        let mut remaining = chunk;
        while !remaining.is_empty() {
            self.stream.lock().reserve_capacity(remaining.len());
            let granted = std::future::poll_fn(|cx| self.stream.lock().poll_capacity(cx)).await;
            let granted = match granted {
                Some(Ok(granted)) => granted,
                Some(Err(error)) => return Err(self.abort_with(h2_error(H2_SEND, error))),
                None => {
                    return Err(self.abort_with(map_io_error(
                        H2_SEND,
                        io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "h2 stream closed before the request body was sent",
                        ),
                    )));
                }
            };
            if granted == 0 {
                continue;
            }
            let part = remaining.split_to(granted.min(remaining.len()));
            let sent = self.stream.lock().send_data(part, false);
            if let Err(error) = sent {
                return Err(self.abort_with(h2_error(H2_SEND, error)));
            }
        }
        Ok(())
    }

    /// 发出 `END_STREAM`；已结束时为空操作。
    pub fn close(&mut self) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.stream
            .lock()
            .send_data(Bytes::new(), true)
            .map_err(|error| h2_error(H2_SEND, error))
    }

    /// 写出整个消息体后结束请求。
    pub async fn write_all(&mut self, body: &DataStream) -> Result<(), TransportError> {
        let mut chunks = match body.as_stream() {
            Ok(chunks) => chunks,
            Err(error) => return Err(self.abort_with(error.into())),
        };
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => self.write(chunk).await?,
                Err(error) => return Err(self.abort_with(error.into())),
            }
        }
        self.close()
    }

    /// 以 `CANCEL` 重置流。
    pub fn abort(&mut self) {
        if !self.finished {
            self.finished = true;
            self.stream.lock().send_reset(Reason::CANCEL);
        }
    }

    fn abort_with(&mut self, error: TransportError) -> TransportError {
        debug!(stream_id = self.stream_id, %error, "request body aborted");
        self.abort();
        error
    }
}

impl Drop for H2BodySink {
    fn drop(&mut self) {
        self.abort();
    }
}

impl fmt::Debug for H2BodySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2BodySink")
            .field("stream_id", &self.stream_id)
            .field("finished", &self.finished)
            .finish()
    }
}

/// h2 交换：占用连接上的一个流。
pub struct H2Exchange {
    pool: ConnectionPool,
    lease: Option<H2Lease>,
    connection_id: ConnectionId,
    stream_id: u32,
    send: Arc<Mutex<SendStream<Bytes>>>,
    sink: Option<H2BodySink>,
    response: Option<Pin<Box<ResponseFuture>>>,
    head: Option<response::Parts>,
    recv: Option<RecvStream>,
    body_taken: bool,
    response_complete: bool,
    state: ExchangeState,
    trailers: Trailers,
    publisher: Option<TrailerPublisher>,
}

impl H2Exchange {
    async fn open(
        pool: &ConnectionPool,
        lease: H2Lease,
        parts: &request::Parts,
        body_length: Option<u64>,
    ) -> Result<Self, TransportError> {
        let connection = lease.connection().clone();
        let request = match build_h2_request(connection.route(), parts, body_length) {
            Ok(request) => request,
            Err(error) => {
                pool.settle_h2(lease);
                return Err(error);
            }
        };
        let mut send_request = match connection.send_request().ready().await {
            Ok(send_request) => send_request,
            Err(error) => {
                let error = h2_error(H2_SEND, error);
                release_after_error(pool, lease, &error);
                return Err(error);
            }
        };
        let end_of_stream = body_length == Some(0);
        let (response, stream) = match send_request.send_request(request, end_of_stream) {
            Ok(opened) => opened,
            Err(error) => {
                let error = h2_error(H2_SEND, error);
                release_after_error(pool, lease, &error);
                return Err(error);
            }
        };
        let stream_id = response.stream_id().as_u32();
        trace!(connection_id = %connection.id(), stream_id, method = %parts.method, "h2 stream opened");
        let send = Arc::new(Mutex::new(stream));
        let (publisher, trailers) = trailer_channel();
        Ok(Self {
            pool: pool.clone(),
            lease: Some(lease),
            connection_id: connection.id(),
            stream_id,
            sink: Some(H2BodySink {
                stream: Arc::clone(&send),
                stream_id,
                finished: end_of_stream,
            }),
            send,
            response: Some(Box::pin(response)),
            head: None,
            recv: None,
            body_taken: false,
            response_complete: false,
            state: ExchangeState::Open,
            trailers,
            publisher: Some(publisher),
        })
    }

    fn sink_mut(&mut self) -> Result<&mut H2BodySink, TransportError> {
        self.sink
            .as_mut()
            .ok_or_else(|| protocol_error(H2_SEND, "request body sink was moved out of the exchange"))
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        let result = self.sink_mut()?.write(chunk).await;
        result.map_err(|error| self.fail(error))
    }

    fn finish_body(&mut self) -> Result<(), TransportError> {
        let result = self.sink_mut()?.close();
        result.map_err(|error| self.fail(error))
    }

    async fn write_body(&mut self, body: &DataStream) -> Result<(), TransportError> {
        let result = self.sink_mut()?.write_all(body).await;
        result.map_err(|error| self.fail(error))
    }

    async fn ensure_head(&mut self) -> Result<&response::Parts, TransportError> {
        if self.head.is_none() {
            let Some(response) = self.response.as_mut() else {
                return Err(cancelled_error(H2_RECV));
            };
            let result = response.await;
            self.response = None;
            match result {
                Ok(response) => {
                    let (head, recv) = response.into_parts();
                    self.response_complete = recv.is_end_stream();
                    self.head = Some(head);
                    self.recv = Some(recv);
                    self.state = ExchangeState::ResponseHeadersReceived;
                }
                Err(error) => return Err(self.fail(h2_error(H2_RECV, error))),
            }
        }
        self.head.as_ref().ok_or_else(|| cancelled_error(H2_RECV))
    }

    async fn response_body(&mut self) -> Result<DataStream, TransportError> {
        let known_length = content_length(&self.ensure_head().await?.headers);
        if self.body_taken {
            return Err(StreamError::AlreadyConsumed.into());
        }
        self.body_taken = true;
        let publisher = self.publisher.take();
        let Some(recv) = self.recv.take() else {
            return Err(cancelled_error(H2_RECV));
        };
        if recv.is_end_stream() {
            if let Some(publisher) = publisher {
                publisher.publish(None);
            }
            self.response_complete = true;
            self.settle();
            return Ok(DataStream::empty());
        }
        let Some(lease) = self.lease.take() else {
            return Err(cancelled_error(H2_RECV));
        };
        let config = self
            .pool
            .config()
            .bridge_config()
            .with_cancel_policy(CancelPolicy::CloseImmediately);
        let (producer, consumer) = BackpressureBridge::new(config).open();
        tokio::spawn(pump_h2(H2Pump {
            pool: self.pool.clone(),
            lease,
            recv,
            send: Arc::clone(&self.send),
            stream_id: self.stream_id,
            publisher,
        }, producer));
        Ok(DataStream::from_bridge(consumer, known_length))
    }

    /// 流级失败只重置本流；连接级失败驱逐整条连接。
    fn fail(&mut self, error: TransportError) -> TransportError {
        self.state = ExchangeState::Failed;
        self.publisher = None;
        if let Some(sink) = self.sink.as_mut() {
            sink.finished = true;
        }
        self.send.lock().send_reset(Reason::CANCEL);
        if let Some(lease) = self.lease.take() {
            debug!(connection_id = %self.connection_id, stream_id = self.stream_id, %error, "h2 exchange failed");
            release_after_error(&self.pool, lease, &error);
        }
        error
    }

    fn settle(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if !self.response_complete {
            trace!(stream_id = self.stream_id, "resetting unfinished h2 stream");
            self.send.lock().send_reset(Reason::CANCEL);
        }
        self.pool.settle_h2(lease);
    }

    fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.abort();
        }
        self.settle();
        self.publisher = None;
        if self.state != ExchangeState::Failed {
            self.state = ExchangeState::Closed;
        }
    }
}

impl Drop for H2Exchange {
    fn drop(&mut self) {
        self.settle();
    }
}

fn release_after_error(pool: &ConnectionPool, lease: H2Lease, error: &TransportError) {
    if error.evicts_connection() {
        pool.evict(Connection::Http2(lease), true);
    } else {
        pool.settle_h2(lease);
    }
}

struct H2Pump {
    pool: ConnectionPool,
    lease: H2Lease,
    recv: RecvStream,
    send: Arc<Mutex<SendStream<Bytes>>>,
    stream_id: u32,
    publisher: Option<TrailerPublisher>,
}

async fn pump_h2(mut pump: H2Pump, mut producer: BridgeProducer) {
    let outcome = loop {
        if producer.demand().await.is_err() {
            break PumpOutcome::Aborted;
        }
        let next = tokio::select! {
            biased;
            _ = producer.aborted() => break PumpOutcome::Aborted,
            next = pump.recv.data() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let len = chunk.len();
                if producer.on_chunk(chunk).await.is_err() {
                    break PumpOutcome::Aborted;
                }
                // 分片交给桥之后才归还窗口：窗口随消费者的需求推进。
                if let Err(error) = pump.recv.flow_control().release_capacity(len) {
                    break PumpOutcome::Failed(h2_error(H2_RECV, error));
                }
            }
            Some(Err(error)) => break PumpOutcome::Failed(h2_error(H2_RECV, error)),
            None => break PumpOutcome::Complete,
        }
    };
    let outcome = match outcome {
        PumpOutcome::Complete => match pump.recv.trailers().await {
            Ok(trailers) => {
                if let Some(publisher) = &pump.publisher {
                    publisher.publish(trailers);
                }
                let _ = producer.on_complete(&[]).await;
                trace!(stream_id = pump.stream_id, "h2 response body complete");
                pump.pool.settle_h2(pump.lease);
                return;
            }
            Err(error) => PumpOutcome::Failed(h2_error(H2_RECV, error)),
        },
        other => other,
    };
    match outcome {
        PumpOutcome::Failed(error) => {
            debug!(stream_id = pump.stream_id, %error, "h2 response body failed");
            let evict = error.evicts_connection();
            let _ = producer.on_error(StreamError::upstream(error)).await;
            if evict {
                pump.pool.evict(Connection::Http2(pump.lease), true);
            } else {
                pump.send.lock().send_reset(Reason::CANCEL);
                pump.pool.settle_h2(pump.lease);
            }
        }
        _ => {
            debug!(stream_id = pump.stream_id, "h2 response body abandoned; resetting stream");
            pump.send.lock().send_reset(Reason::CANCEL);
            pump.pool.settle_h2(pump.lease);
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn is_connection_specific(name: &HeaderName, value: &HeaderValue) -> bool {
    if *name == header::TE {
        return !value.as_bytes().eq_ignore_ascii_case(b"trailers");
    }
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || *name == header::HOST
        || *name == header::CONTENT_LENGTH
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// 构造 h2 请求：绝对 URI 携带 `:scheme`/`:authority`，剔除连接级头部。
fn build_h2_request(
    route: &Route,
    parts: &request::Parts,
    body_length: Option<u64>,
) -> Result<Request<()>, TransportError> {
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    let uri = Uri::builder()
        .scheme(route.scheme().as_str())
        .authority(route.authority())
        .path_and_query(path)
        .build()
        .map_err(|error| protocol_error(H2_SEND, format!("invalid request target: {error}")))?;

    let mut request = Request::new(());
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_2;
    let headers = request.headers_mut();
    for (name, value) in &parts.headers {
        if !is_connection_specific(name, value) {
            headers.append(name, value.clone());
        }
    }
    let expects_body = matches!(parts.method, Method::POST | Method::PUT | Method::PATCH);
    if let Some(length) = body_length
        && (length > 0 || expects_body)
    {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Scheme;

    fn parts(builder: http::request::Builder) -> request::Parts {
        builder.body(()).expect("请求应合法").into_parts().0
    }

    #[test]
    fn h2_request_strips_connection_specific_headers() {
        let route = Route::new(Scheme::Https, "api.example.com", 8443).expect("路由合法");
        let parts = parts(
            Request::post("https://api.example.com:8443/v1/items?page=2")
                .header(header::CONNECTION, "keep-alive")
                .header("keep-alive", "timeout=5")
                .header(header::TRANSFER_ENCODING, "chunked")
                .header(header::HOST, "api.example.com")
                .header(header::TE, "gzip")
                .header("x-trace", "abc"),
        );
        let request = build_h2_request(&route, &parts, Some(11)).expect("构造 h2 请求");

        assert_eq!(
            request.uri().to_string(),
            "https://api.example.com:8443/v1/items?page=2"
        );
        let headers = request.headers();
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::TE).is_none());
        assert_eq!(headers.get("x-trace").map(HeaderValue::as_bytes), Some(&b"abc"[..]));
        assert_eq!(
            headers.get(header::CONTENT_LENGTH).map(HeaderValue::as_bytes),
            Some(&b"11"[..])
        );
    }

    #[test]
    fn te_trailers_survives_and_empty_get_has_no_length() {
        let route = Route::new(Scheme::Http, "localhost", 80).expect("路由合法");
        let parts = parts(Request::get("http://localhost/health").header(header::TE, "trailers"));
        let request = build_h2_request(&route, &parts, Some(0)).expect("构造 h2 请求");

        assert_eq!(request.uri().to_string(), "http://localhost/health");
        assert_eq!(
            request.headers().get(header::TE).map(HeaderValue::as_bytes),
            Some(&b"trailers"[..])
        );
        assert!(request.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn trailers_resolve_once_published() {
        let (publisher, trailers) = trailer_channel();
        assert!(!trailers.is_ready());
        assert!(trailers.get().is_none());

        let waiter = {
            let trailers = trailers.clone();
            tokio::spawn(async move { trailers.wait().await })
        };
        let mut fields = HeaderMap::new();
        fields.insert("grpc-status", HeaderValue::from_static("0"));
        publisher.publish(Some(fields));

        let received = waiter.await.expect("等待任务").expect("应收到尾部字段");
        assert_eq!(received.get("grpc-status").map(HeaderValue::as_bytes), Some(&b"0"[..]));
        assert!(trailers.is_ready());
    }

    #[tokio::test]
    async fn dropped_publisher_resolves_to_none() {
        let (publisher, trailers) = trailer_channel();
        drop(publisher);
        assert!(trailers.wait().await.is_none());
    }
}
