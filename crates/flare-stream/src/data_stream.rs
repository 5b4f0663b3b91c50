use crate::bridge::{BackpressureBridge, BridgeConsumer};
use crate::error::StreamError;
use crate::subscriber::{Subscriber, Subscription};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// `content_length()` 对未知长度（chunked / 流式消息体）的返回值。
pub const UNKNOWN_LENGTH: i64 = -1;

/// 物化消息体时按声明长度预分配的上限；声明长度来自对端，不可信。
const PREALLOCATION_CAP: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

enum Source {
    Replayable(Bytes),
    Stream(BoxStream<'static, Result<Bytes, StreamError>>),
    Bridge(BridgeConsumer),
    Consumed,
}

struct Body {
    source: Mutex<Source>,
    replayable: bool,
}

/// 请求 / 响应消息体。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让传输层与上层 RPC 客户端用同一个类型表达“内存字节”“异步流”“推送式生产方”
///   三种消息体，避免在每个调用点分别处理；
/// - 把“只能读一次”的约束做成运行时契约：克隆出的句柄共享同一来源，第二次读取得到
///   [`StreamError::AlreadyConsumed`]，而不是读到半截数据。
///
/// ## 逻辑 (How)
/// - 来源保存在 `Arc<Body>` 内的互斥槽中；可重放来源每次克隆 `Bytes`（引用计数，不复制），
///   单次来源在首次读取时被取走并替换为 `Consumed`；
/// - 推送式来源（[`BridgeConsumer`]）在物化或转为流时经 [`BodyStream`] 以一次一个分片的需求拉取。
///
/// ## 契约 (What)
/// - `content_length()`：已知长度返回字节数，未知返回 [`UNKNOWN_LENGTH`]；
/// - `as_bytes`/`as_string`/`as_stream`/`write_to`/`subscribe`：任一成功调用都会消费单次来源；
/// - **前置条件**：`subscribe` 与基于桥的读取需在 Tokio 运行时内调用。
///
/// ## 注意事项 (Trade-offs)
/// - 物化时最多预分配 64 KiB，超出部分随数据到达增长，防止对端虚报长度耗尽内存；
/// - 需要硬上限时使用 `as_bytes_limited`。
#[derive(Clone)]
pub struct DataStream {
    body: Arc<Body>,
    content_length: i64,
    content_type: Option<Arc<str>>,
}

impl DataStream {
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// 可重放的内存消息体。
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let content_length = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        Self::with_source(Source::Replayable(bytes), true, content_length)
    }

    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self::from_bytes(Bytes::from_static(bytes))
    }

    pub fn from_string(text: impl Into<String>) -> Self {
        Self::from_bytes(Bytes::from(text.into()))
    }

    /// 单次消费的流式消息体。
    pub fn from_stream<S>(stream: S, content_length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    {
        Self::with_source(Source::Stream(stream.boxed()), false, to_length(content_length))
    }

    /// 以 `AsyncRead` 为来源的单次消费消息体，每次最多读取 16 KiB。
    pub fn from_reader<R>(reader: R, content_length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let chunks = stream::unfold(Some(reader), |state| async move {
            let mut reader = state?;
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            match reader.read_buf(&mut buf).await {
                Ok(0) => None,
                Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
                Err(err) => Some((Err(StreamError::io("body read", err)), None)),
            }
        });
        Self::from_stream(chunks, content_length)
    }

    /// 打开文件作为消息体，长度取自文件元数据。
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let file = tokio::fs::File::open(path.as_ref())
            .await
            .map_err(|err| StreamError::io("open body file", err))?;
        let length = file
            .metadata()
            .await
            .map_err(|err| StreamError::io("stat body file", err))?
            .len();
        Ok(Self::from_reader(file, Some(length)))
    }

    /// 以推送式生产方为来源的单次消费消息体。
    pub fn from_bridge(consumer: BridgeConsumer, content_length: Option<u64>) -> Self {
        Self::with_source(Source::Bridge(consumer), false, to_length(content_length))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(Arc::from(content_type.into()));
        self
    }

    fn with_source(source: Source, replayable: bool, content_length: i64) -> Self {
        Self {
            body: Arc::new(Body {
                source: Mutex::new(source),
                replayable,
            }),
            content_length,
            content_type: None,
        }
    }

    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    pub fn known_length(&self) -> Option<u64> {
        u64::try_from(self.content_length).ok()
    }

    pub fn has_known_length(&self) -> bool {
        self.content_length >= 0
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_replayable(&self) -> bool {
        self.body.replayable
    }

    /// 是否仍可读取：可重放消息体恒为 `true`，单次消息体在被消费前为 `true`。
    pub fn is_available(&self) -> bool {
        !matches!(&*self.body.source.lock(), Source::Consumed)
    }

    /// 可重放时直接返回内存字节，不消费任何东西。
    pub fn replayable_bytes(&self) -> Option<Bytes> {
        match &*self.body.source.lock() {
            Source::Replayable(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn take(&self) -> Result<Source, StreamError> {
        let mut guard = self.body.source.lock();
        match &*guard {
            Source::Replayable(bytes) => Ok(Source::Replayable(bytes.clone())),
            Source::Consumed => Err(StreamError::AlreadyConsumed),
            _ => Ok(std::mem::replace(&mut *guard, Source::Consumed)),
        }
    }

    pub async fn as_bytes(&self) -> Result<Bytes, StreamError> {
        self.collect(None).await
    }

    /// 物化消息体，超过 `limit` 字节时返回 [`StreamError::BodyTooLarge`]。
    pub async fn as_bytes_limited(&self, limit: usize) -> Result<Bytes, StreamError> {
        self.collect(Some(limit)).await
    }

    pub async fn as_string(&self) -> Result<String, StreamError> {
        let bytes = self.as_bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|source| StreamError::InvalidUtf8 { source })
    }

    /// 转为分片流。
    pub fn as_stream(&self) -> Result<BoxStream<'static, Result<Bytes, StreamError>>, StreamError> {
        into_chunks(self.take()?)
    }

    /// 把消息体完整写入 `sink`，返回写入的字节数。
    pub async fn write_to<W>(&self, sink: &mut W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut chunks = self.as_stream()?;
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            sink.write_all(&chunk)
                .await
                .map_err(|err| StreamError::io("body write", err))?;
            written += chunk.len() as u64;
        }
        sink.flush()
            .await
            .map_err(|err| StreamError::io("body flush", err))?;
        Ok(written)
    }

    /// 以拉取协议订阅消息体。
    pub fn subscribe(&self, subscriber: Box<dyn Subscriber>) -> Result<(), StreamError> {
        match self.take()? {
            Source::Bridge(consumer) => consumer.subscribe(subscriber),
            other => {
                let chunks = into_chunks(other)?;
                BackpressureBridge::default()
                    .pipe(chunks)
                    .subscribe(subscriber)
            }
        }
    }

    async fn collect(&self, limit: Option<usize>) -> Result<Bytes, StreamError> {
        let source = self.take()?;
        if let Source::Replayable(bytes) = source {
            return match limit {
                Some(limit) if bytes.len() > limit => Err(StreamError::BodyTooLarge { limit }),
                _ => Ok(bytes),
            };
        }

        let preallocate = self
            .known_length()
            .map_or(0, |len| usize::try_from(len).unwrap_or(usize::MAX))
            .min(PREALLOCATION_CAP)
            .min(limit.unwrap_or(usize::MAX));
        let mut buf = BytesMut::with_capacity(preallocate);
        let mut chunks = into_chunks(source)?;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if let Some(limit) = limit
                && buf.len() + chunk.len() > limit
            {
                return Err(StreamError::BodyTooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("replayable", &self.is_replayable())
            .field("available", &self.is_available())
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl Default for DataStream {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for DataStream {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for DataStream {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<String> for DataStream {
    fn from(text: String) -> Self {
        Self::from_string(text)
    }
}

impl From<&'static str> for DataStream {
    fn from(text: &'static str) -> Self {
        Self::from_static(text.as_bytes())
    }
}

fn to_length(content_length: Option<u64>) -> i64 {
    content_length.map_or(UNKNOWN_LENGTH, |len| {
        i64::try_from(len).unwrap_or(i64::MAX)
    })
}

fn into_chunks(
    source: Source,
) -> Result<BoxStream<'static, Result<Bytes, StreamError>>, StreamError> {
    match source {
        Source::Replayable(bytes) if bytes.is_empty() => Ok(stream::empty().boxed()),
        Source::Replayable(bytes) => Ok(stream::once(async move { Ok(bytes) }).boxed()),
        Source::Stream(chunks) => Ok(chunks),
        Source::Bridge(consumer) => Ok(BodyStream::new(consumer)?.boxed()),
        Source::Consumed => Err(StreamError::AlreadyConsumed),
    }
}

enum Signal {
    Next(Bytes),
    Error(StreamError),
    Complete,
}

/// 把订阅者回调转为 `Stream` 的适配器。
struct ChannelSubscriber {
    tx: mpsc::Sender<Signal>,
}

impl Subscriber for ChannelSubscriber {
    fn on_subscribe(&mut self, _subscription: Subscription) {}

    // 需求固定为一次一个分片，通道内最多同时存在一个分片加一个终止信号。
    fn on_next(&mut self, chunk: Bytes) {
        let _ = self.tx.try_send(Signal::Next(chunk));
    }

    fn on_error(&mut self, error: StreamError) {
        let _ = self.tx.try_send(Signal::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.tx.try_send(Signal::Complete);
    }
}

/// 以拉取方式读取桥的分片流：每次 `poll_next` 最多请求一个分片。
///
/// 流在结束前被丢弃时会取消订阅，桥随之按取消策略处理剩余输入。
pub struct BodyStream {
    rx: mpsc::Receiver<Signal>,
    subscription: Subscription,
    in_flight: bool,
    finished: bool,
}

impl BodyStream {
    pub fn new(consumer: BridgeConsumer) -> Result<Self, StreamError> {
        let (tx, rx) = mpsc::channel(2);
        let subscription = consumer.subscription();
        consumer.subscribe(Box::new(ChannelSubscriber { tx }))?;
        Ok(Self {
            rx,
            subscription,
            in_flight: false,
            finished: false,
        })
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if !this.in_flight {
            if let Err(err) = this.subscription.request(1) {
                this.finished = true;
                return Poll::Ready(Some(Err(err)));
            }
            this.in_flight = true;
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(Signal::Next(chunk)) => {
                this.in_flight = false;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Signal::Error(err)) => {
                this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Some(Signal::Complete) => {
                this.finished = true;
                Poll::Ready(None)
            }
            None => {
                this.finished = true;
                Poll::Ready(Some(Err(StreamError::Cancelled)))
            }
        }
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        if !self.finished {
            self.subscription.cancel();
        }
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("in_flight", &self.in_flight)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replayable_body_can_be_read_repeatedly() {
        let body = DataStream::from_static(b"hello");
        assert!(body.is_replayable());
        assert_eq!(body.content_length(), 5);
        assert_eq!(body.as_bytes().await.expect("第一次读取"), "hello");
        assert_eq!(body.as_string().await.expect("第二次读取"), "hello");
        assert!(body.is_available());
    }

    #[tokio::test]
    async fn single_consumption_body_fails_on_second_read() {
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"c"))]);
        let body = DataStream::from_stream(chunks, None);
        let clone = body.clone();
        assert_eq!(body.content_length(), UNKNOWN_LENGTH);
        assert!(!body.has_known_length());
        assert_eq!(body.as_bytes().await.expect("首次读取"), "abc");
        assert!(!clone.is_available());
        assert!(matches!(
            clone.as_bytes().await,
            Err(StreamError::AlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn limited_materialization_rejects_oversized_bodies() {
        let chunks = stream::iter(vec![Ok(Bytes::from(vec![0u8; 10])), Ok(Bytes::from(vec![0u8; 10]))]);
        let body = DataStream::from_stream(chunks, Some(u64::MAX));
        assert!(matches!(
            body.as_bytes_limited(15).await,
            Err(StreamError::BodyTooLarge { limit: 15 })
        ));
    }

    #[tokio::test]
    async fn reader_and_file_sources_are_single_consumption() {
        let path = std::env::temp_dir().join(format!("flare-body-{}.bin", std::process::id()));
        std::fs::write(&path, b"file-body").expect("写入临时文件失败");
        let body = DataStream::from_file(&path)
            .await
            .expect("打开文件失败")
            .with_content_type("application/octet-stream");
        assert_eq!(body.content_length(), 9);
        assert_eq!(body.content_type(), Some("application/octet-stream"));

        let mut sink = Vec::new();
        let written = body.write_to(&mut sink).await.expect("写出失败");
        assert_eq!(written, 9);
        assert_eq!(sink, b"file-body");
        assert!(matches!(
            body.write_to(&mut Vec::new()).await,
            Err(StreamError::AlreadyConsumed)
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn bridge_backed_body_streams_through_demand() {
        let (mut producer, consumer) = BackpressureBridge::default().open();
        let body = DataStream::from_bridge(consumer, Some(6));
        tokio::spawn(async move {
            for part in [&b"abc"[..], b"def"] {
                if producer.demand().await.is_err() {
                    return;
                }
                let _ = producer.on_bytes(part).await;
            }
            let _ = producer.on_complete(b"").await;
        });
        assert_eq!(body.as_string().await.expect("读取失败"), "abcdef");
    }
}
