use crate::demand::DemandCounter;
use crate::error::StreamError;
use crate::subscriber::{Subscriber, Subscription};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// 生产方事件通道容量：一次未完成的读取最多产生一个分片，外加一个终止信号。
const EVENT_CAPACITY: usize = 2;
const DEFAULT_MAX_SWALLOW: Duration = Duration::from_secs(10);
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

const ATTACH_NONE: u8 = 0;
const ATTACH_ACTIVE: u8 = 1;
const ATTACH_DONE: u8 = 2;

/// 消费方取消（或生产方报错）之后如何处理连接上尚未读完的字节。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `Swallow`：继续读取并丢弃剩余字节，让 HTTP/1.1 连接停在报文边界上，从而可以
///   放回连接池复用；代价是取消后仍要付出一段有上限的读取时间；
/// - `CloseImmediately`：立即中止生产方，连接随之关闭，取消延迟最低但放弃复用。
///
/// ## 契约（What）
/// - `Swallow` 的吞吐时长受 [`BridgeConfig::max_swallow_duration`] 限制，超时后强制中止；
/// - 两种策略下，取消之后原订阅者都不会再收到任何信号。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CancelPolicy {
    #[default]
    Swallow,
    CloseImmediately,
}

/// 背压桥的可调参数。
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    max_swallow_duration: Duration,
    cancel_policy: CancelPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeConfig {
    pub const fn new() -> Self {
        Self {
            max_swallow_duration: DEFAULT_MAX_SWALLOW,
            cancel_policy: CancelPolicy::Swallow,
        }
    }

    pub const fn with_max_swallow_duration(mut self, duration: Duration) -> Self {
        self.max_swallow_duration = duration;
        self
    }

    pub const fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    pub const fn max_swallow_duration(&self) -> Duration {
        self.max_swallow_duration
    }

    pub const fn cancel_policy(&self) -> CancelPolicy {
        self.cancel_policy
    }
}

/// 背压桥的显式状态。
///
/// - `Idle`：尚无订阅者，生产方也未送来任何事件；
/// - `AwaitingSubscriber`：生产方已送来数据或终止信号，等待订阅者接入；
/// - `Streaming`：订阅者已接入，按需求投递；
/// - `Swallowing`：订阅者已取消，继续读取并丢弃直到生产方完成或超时；
/// - `Closed`：终态。
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Idle = 0,
    AwaitingSubscriber = 1,
    Streaming = 2,
    Swallowing = 3,
    Closed = 4,
}

impl BridgeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::AwaitingSubscriber,
            2 => Self::Streaming,
            3 => Self::Swallowing,
            _ => Self::Closed,
        }
    }
}

/// 生产方被消费侧中止（取消或吞吐超时）。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("body consumer aborted the producer")]
pub struct ProducerAborted;

/// 驱动任务、生产方与消费方共享的控制面。
pub(crate) struct Shared {
    demand: DemandCounter,
    cancelled: AtomicBool,
    rejected_demand: Mutex<Option<i64>>,
    attach: AtomicU8,
    pending_subscriber: Mutex<Option<Box<dyn Subscriber>>>,
    wake: Notify,
    aborted: AtomicBool,
    abort_notify: Notify,
    state: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            demand: DemandCounter::new(),
            cancelled: AtomicBool::new(false),
            rejected_demand: Mutex::new(None),
            attach: AtomicU8::new(ATTACH_NONE),
            pending_subscriber: Mutex::new(None),
            wake: Notify::new(),
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
            state: AtomicU8::new(BridgeState::Idle as u8),
        }
    }

    pub(crate) fn add_demand(&self, n: u64) {
        if self.is_cancelled() {
            return;
        }
        self.demand.add(n);
        self.wake.notify_one();
    }

    pub(crate) fn reject_demand(&self, requested: i64) {
        *self.rejected_demand.lock() = Some(requested);
        self.wake.notify_one();
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.abort_notify.notify_waiters();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    async fn aborted(&self) {
        loop {
            // 先创建 `Notified` 再检查标志位，`notify_waiters` 对已创建的 future 必然可见。
            let notified = self.abort_notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// 推拉背压桥的工厂：持有配置，每个消息体 `open` 一次。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 传输层“字节到了就推”，消费者“要多少拉多少”；桥负责在两者之间维持
///   “投递数 ≤ 需求数”的不变式，并在取消时决定连接的去留。
///
/// ## 逻辑 (How)
/// - `open` 创建共享控制面并 `tokio::spawn` 一个驱动任务，状态机只在该任务内变化；
/// - 生产方经容量为 2 的有界通道送来 `Chunk`/`Complete`/`Error` 事件；
/// - 驱动任务经单槽通道向生产方发出“读一次”指令，保证任一时刻最多一个读取在途；
/// - 消费方的 `subscribe`/`request`/`cancel` 写入共享原子量并唤醒驱动任务。
///
/// ## 契约 (What)
/// - `open` 必须在 Tokio 运行时内调用；
/// - `pipe` 把任意 `Stream` 接到一个新桥的生产端，适合把内存数据或文件暴露为推送源。
///
/// ## 注意事项 (Trade-offs)
/// - 每个消息体占用一个轻量任务；相比在 IO 任务上直接回调订阅者，多一次任务切换，
///   换来的是投递永不发生在 IO 线程上、也不会形成递归调用栈。
#[derive(Clone, Debug, Default)]
pub struct BackpressureBridge {
    config: BridgeConfig,
}

impl BackpressureBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// 打开一座新桥，返回生产端与消费端。
    pub fn open(&self) -> (BridgeProducer, BridgeConsumer) {
        let shared = Arc::new(Shared::new());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (read_tx, read_rx) = mpsc::channel(1);
        let driver = Driver {
            shared: Arc::clone(&shared),
            config: self.config.clone(),
            events: event_rx,
            reads: read_tx,
            state: BridgeState::Idle,
            subscriber: None,
            queue: VecDeque::new(),
            demand: 0,
            read_outstanding: false,
            producer_finished: false,
            terminal: None,
            swallow_deadline: None,
        };
        tokio::spawn(driver.run());
        (
            BridgeProducer {
                shared: Arc::clone(&shared),
                events: event_tx,
                reads: read_rx,
            },
            BridgeConsumer { shared },
        )
    }

    /// 以 `stream` 作为生产方打开一座桥。
    pub fn pipe<S>(&self, stream: S) -> BridgeConsumer
    where
        S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    {
        let (mut producer, consumer) = self.open();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                if producer.demand().await.is_err() {
                    return;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        if producer.on_chunk(chunk).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        let _ = producer.on_error(error).await;
                        return;
                    }
                    None => {
                        let _ = producer.on_complete(&[]).await;
                        return;
                    }
                }
            }
        });
        consumer
    }
}

/// 桥的生产端，由传输层的读取循环持有。
///
/// 典型循环：`demand().await` → 从套接字读取 → `on_bytes` / `on_complete`；
/// 同时以 `aborted()` 监听吞吐超时，收到后应立即关闭底层连接。
pub struct BridgeProducer {
    shared: Arc<Shared>,
    events: mpsc::Sender<Event>,
    reads: mpsc::Receiver<()>,
}

impl BridgeProducer {
    /// 等待驱动任务请求下一次读取。
    pub async fn demand(&mut self) -> Result<(), ProducerAborted> {
        if self.shared.is_aborted() {
            return Err(ProducerAborted);
        }
        tokio::select! {
            biased;
            _ = self.shared.aborted() => Err(ProducerAborted),
            read = self.reads.recv() => read.ok_or(ProducerAborted),
        }
    }

    /// 复制传输层持有的缓冲区后入队；调用返回后调用方即可复用 `buf`。
    pub async fn on_bytes(&mut self, buf: &[u8]) -> Result<(), ProducerAborted> {
        self.on_chunk(Bytes::copy_from_slice(buf)).await
    }

    /// 直接移交一个已归调用方所有的分片。
    pub async fn on_chunk(&mut self, chunk: Bytes) -> Result<(), ProducerAborted> {
        self.send(Event::Chunk(chunk)).await
    }

    /// 送出最后一段数据（可为空）与完成信号。
    pub async fn on_complete(self, buf: &[u8]) -> Result<(), ProducerAborted> {
        let tail = (!buf.is_empty()).then(|| Bytes::copy_from_slice(buf));
        self.send(Event::Complete(tail)).await
    }

    /// 报告生产方失败；错误由驱动任务异步投递，之后桥按取消策略处理剩余输入。
    pub async fn on_error(&mut self, error: StreamError) -> Result<(), ProducerAborted> {
        self.send(Event::Error(error)).await
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    /// 在消费侧强制中止时完成。
    pub async fn aborted(&self) {
        self.shared.aborted().await;
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    async fn send(&self, event: Event) -> Result<(), ProducerAborted> {
        if self.shared.is_aborted() {
            return Err(ProducerAborted);
        }
        self.events.send(event).await.map_err(|_| ProducerAborted)
    }
}

impl fmt::Debug for BridgeProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeProducer")
            .field("state", &self.state())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// 桥的消费端。
///
/// 丢弃一个从未订阅过的消费端等同于 `cancel()`，生产方随即进入吞吐或中止路径。
pub struct BridgeConsumer {
    shared: Arc<Shared>,
}

impl BridgeConsumer {
    /// 接入唯一的订阅者。
    ///
    /// 已有活跃订阅者时返回 [`StreamError::AlreadySubscribed`]；
    /// 订阅已结束或已取消时返回 [`StreamError::AlreadyConsumed`]。
    pub fn subscribe(&self, subscriber: Box<dyn Subscriber>) -> Result<(), StreamError> {
        match self.shared.attach.compare_exchange(
            ATTACH_NONE,
            ATTACH_ACTIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                *self.shared.pending_subscriber.lock() = Some(subscriber);
                self.shared.wake.notify_one();
                Ok(())
            }
            Err(ATTACH_ACTIVE) => Err(StreamError::AlreadySubscribed),
            Err(_) => Err(StreamError::AlreadyConsumed),
        }
    }

    pub fn cancel(&self) {
        let _ = self.shared.attach.compare_exchange(
            ATTACH_NONE,
            ATTACH_DONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shared.cancel();
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    pub(crate) fn subscription(&self) -> Subscription {
        Subscription::new(Arc::clone(&self.shared))
    }
}

impl Drop for BridgeConsumer {
    fn drop(&mut self) {
        if self.shared.attach.load(Ordering::Acquire) == ATTACH_NONE {
            self.cancel();
        }
    }
}

impl fmt::Debug for BridgeConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConsumer")
            .field("state", &self.state())
            .finish()
    }
}

enum Event {
    Chunk(Bytes),
    Complete(Option<Bytes>),
    Error(StreamError),
}

enum Terminal {
    Complete,
    Error(StreamError),
}

/// 状态机本体，只在驱动任务内被访问。
struct Driver {
    shared: Arc<Shared>,
    config: BridgeConfig,
    events: mpsc::Receiver<Event>,
    reads: mpsc::Sender<()>,
    state: BridgeState,
    subscriber: Option<Box<dyn Subscriber>>,
    queue: VecDeque<Bytes>,
    demand: u64,
    read_outstanding: bool,
    producer_finished: bool,
    terminal: Option<Terminal>,
    swallow_deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.absorb_control();
            self.deliver();
            if self.state == BridgeState::Closed {
                break;
            }
            self.schedule_read();

            let deadline = self.swallow_deadline;
            let sleep_target = deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);
            tokio::select! {
                biased;
                _ = self.shared.wake.notified() => {}
                event = self.events.recv(), if !self.producer_finished => self.on_event(event),
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    self.expire_swallow();
                }
            }
        }
        self.shared.attach.store(ATTACH_DONE, Ordering::Release);
    }

    fn set_state(&mut self, next: BridgeState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "backpressure bridge transition");
            self.state = next;
            self.shared.state.store(next as u8, Ordering::Release);
        }
    }

    /// 吸收消费侧写入共享控制面的信号：非法需求、订阅接入、新增需求与取消。
    fn absorb_control(&mut self) {
        let rejected = self.shared.rejected_demand.lock().take();
        if let Some(requested) = rejected {
            debug!(requested, "non-positive demand rejected");
            if let Some(mut subscriber) = self.subscriber.take() {
                subscriber.on_error(StreamError::InvalidDemand { requested });
            }
            if self.is_live() {
                self.begin_cancel();
            }
            return;
        }

        if self.subscriber.is_none()
            && matches!(
                self.state,
                BridgeState::Idle | BridgeState::AwaitingSubscriber
            )
        {
            let pending = self.shared.pending_subscriber.lock().take();
            if let Some(mut subscriber) = pending {
                self.set_state(BridgeState::Streaming);
                subscriber.on_subscribe(Subscription::new(Arc::clone(&self.shared)));
                self.subscriber = Some(subscriber);
            }
        }

        let added = self.shared.demand.take();
        if added > 0 {
            self.demand = self.demand.saturating_add(added);
        }

        if self.shared.is_cancelled() && self.is_live() {
            self.begin_cancel();
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            BridgeState::Idle | BridgeState::AwaitingSubscriber | BridgeState::Streaming
        )
    }

    /// 在需求范围内按 FIFO 投递分片；队列清空后再投递终止信号。
    fn deliver(&mut self) {
        if self.state != BridgeState::Streaming {
            return;
        }
        while self.demand > 0 {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            self.demand -= 1;
            if let Some(subscriber) = self.subscriber.as_mut() {
                subscriber.on_next(chunk);
            }
            // 订阅者可能在 on_next 内请求更多需求或取消。
            self.absorb_control();
            if self.state != BridgeState::Streaming {
                return;
            }
        }
        if self.queue.is_empty()
            && let Some(terminal) = self.terminal.take()
        {
            if let Some(mut subscriber) = self.subscriber.take() {
                match terminal {
                    Terminal::Complete => subscriber.on_complete(),
                    Terminal::Error(error) => subscriber.on_error(error),
                }
            }
            self.set_state(BridgeState::Closed);
        }
    }

    fn schedule_read(&mut self) {
        if self.read_outstanding || self.producer_finished {
            return;
        }
        let wanted = match self.state {
            BridgeState::Streaming => self.demand > self.queue.len() as u64,
            BridgeState::Swallowing => true,
            _ => false,
        };
        if !wanted {
            return;
        }
        match self.reads.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => self.read_outstanding = true,
            // 生产方已离开，事件通道随后会返回 None，由 on_event 收尾。
            Err(TrySendError::Closed(())) => self.read_outstanding = true,
        }
    }

    fn on_event(&mut self, event: Option<Event>) {
        match event {
            Some(Event::Chunk(chunk)) => {
                self.read_outstanding = false;
                match self.state {
                    BridgeState::Swallowing | BridgeState::Closed => {
                        trace!(len = chunk.len(), "swallowed body chunk");
                    }
                    _ => {
                        self.queue.push_back(chunk);
                        if self.state == BridgeState::Idle {
                            self.set_state(BridgeState::AwaitingSubscriber);
                        }
                    }
                }
            }
            Some(Event::Complete(tail)) => {
                self.read_outstanding = false;
                self.producer_finished = true;
                if self.state == BridgeState::Swallowing {
                    debug!("cancelled body drained to its end");
                    self.swallow_deadline = None;
                    self.set_state(BridgeState::Closed);
                    return;
                }
                if let Some(tail) = tail {
                    self.queue.push_back(tail);
                }
                self.terminal = Some(Terminal::Complete);
                if self.state == BridgeState::Idle {
                    self.set_state(BridgeState::AwaitingSubscriber);
                }
            }
            Some(Event::Error(error)) => {
                self.read_outstanding = false;
                self.queue.clear();
                match self.subscriber.take() {
                    Some(mut subscriber) => subscriber.on_error(error),
                    None if self.is_live() => {
                        // 尚无订阅者：保留错误，待订阅者接入后投递。
                        self.terminal = Some(Terminal::Error(error));
                        if self.state == BridgeState::Idle {
                            self.set_state(BridgeState::AwaitingSubscriber);
                        }
                        return;
                    }
                    None => debug!(%error, "producer error after the subscriber detached"),
                }
                if self.is_live() {
                    self.begin_cancel();
                }
            }
            None => {
                self.read_outstanding = false;
                self.producer_finished = true;
                if self.state == BridgeState::Swallowing {
                    self.swallow_deadline = None;
                    self.set_state(BridgeState::Closed);
                } else if self.terminal.is_none() {
                    self.terminal = Some(Terminal::Error(StreamError::ProducerGone));
                    if self.state == BridgeState::Idle {
                        self.set_state(BridgeState::AwaitingSubscriber);
                    }
                }
            }
        }
    }

    /// 取消路径：断开订阅者，按策略进入吞吐或直接中止生产方。
    fn begin_cancel(&mut self) {
        self.subscriber = None;
        self.queue.clear();
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.attach.store(ATTACH_DONE, Ordering::Release);

        if self.producer_finished {
            self.terminal = None;
            self.set_state(BridgeState::Closed);
            return;
        }
        match self.config.cancel_policy {
            CancelPolicy::CloseImmediately => {
                debug!("body cancelled, aborting producer");
                self.shared.abort();
                self.set_state(BridgeState::Closed);
            }
            CancelPolicy::Swallow => {
                debug!(
                    max = ?self.config.max_swallow_duration,
                    "body cancelled, swallowing remaining input"
                );
                self.swallow_deadline = Some(Instant::now() + self.config.max_swallow_duration);
                self.set_state(BridgeState::Swallowing);
            }
        }
    }

    fn expire_swallow(&mut self) {
        warn!(
            max = ?self.config.max_swallow_duration,
            "swallow deadline exceeded, force closing the producer"
        );
        self.swallow_deadline = None;
        self.shared.abort();
        self.set_state(BridgeState::Closed);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Record {
        chunks: Vec<Bytes>,
        errors: Vec<String>,
        completed: bool,
        subscription: Option<Subscription>,
    }

    struct Recorder {
        record: Arc<Mutex<Record>>,
        initial: i64,
    }

    impl Subscriber for Recorder {
        fn on_subscribe(&mut self, subscription: Subscription) {
            if self.initial != 0 {
                let _ = subscription.request(self.initial);
            }
            self.record.lock().subscription = Some(subscription);
        }

        fn on_next(&mut self, chunk: Bytes) {
            self.record.lock().chunks.push(chunk);
        }

        fn on_error(&mut self, error: StreamError) {
            self.record.lock().errors.push(error.to_string());
        }

        fn on_complete(&mut self) {
            self.record.lock().completed = true;
        }
    }

    fn recorder(initial: i64) -> (Box<dyn Subscriber>, Arc<Mutex<Record>>) {
        let record = Arc::new(Mutex::new(Record::default()));
        (
            Box::new(Recorder {
                record: Arc::clone(&record),
                initial,
            }),
            record,
        )
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn non_positive_demand_is_an_explicit_error() {
        let (_producer, consumer) = BackpressureBridge::default().open();
        let (subscriber, record) = recorder(0);
        consumer.subscribe(subscriber).expect("订阅失败");
        settle().await;

        let subscription = record.lock().subscription.clone().expect("缺少订阅句柄");
        let err = subscription.request(0).expect_err("n = 0 必须报错");
        assert!(matches!(err, StreamError::InvalidDemand { requested: 0 }));
        settle().await;
        assert_eq!(record.lock().errors.len(), 1);
        assert!(subscription.is_cancelled());
    }

    #[tokio::test]
    async fn second_subscriber_is_rejected_while_first_is_active() {
        let (_producer, consumer) = BackpressureBridge::default().open();
        let (first, _) = recorder(1);
        let (second, _) = recorder(1);
        consumer.subscribe(first).expect("首个订阅必须成功");
        let err = consumer.subscribe(second).expect_err("第二个订阅必须失败");
        assert!(matches!(err, StreamError::AlreadySubscribed));
    }

    #[tokio::test]
    async fn deliveries_follow_demand_in_fifo_order() {
        let (mut producer, consumer) = BackpressureBridge::default().open();
        let (subscriber, record) = recorder(1);
        consumer.subscribe(subscriber).expect("订阅失败");

        let feeder = tokio::spawn(async move {
            for part in [&b"a"[..], b"b", b"c"] {
                producer.demand().await.expect("等待需求失败");
                producer.on_bytes(part).await.expect("写入分片失败");
            }
            producer.on_complete(b"").await.expect("完成信号失败");
        });

        settle().await;
        assert_eq!(record.lock().chunks, vec![Bytes::from_static(b"a")]);

        let subscription = record.lock().subscription.clone().expect("缺少订阅句柄");
        subscription.request(5).expect("追加需求失败");
        feeder.await.expect("生产任务 panic");
        settle().await;

        let record = record.lock();
        assert_eq!(
            record.chunks,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
        assert!(record.completed);
        assert_eq!(consumer.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn cancel_swallows_until_the_producer_completes() {
        let (mut producer, consumer) = BackpressureBridge::default().open();
        let (subscriber, record) = recorder(1);
        consumer.subscribe(subscriber).expect("订阅失败");

        producer.demand().await.expect("等待需求失败");
        producer.on_bytes(b"first").await.expect("写入失败");
        settle().await;

        let subscription = record.lock().subscription.clone().expect("缺少订阅句柄");
        subscription.cancel();
        settle().await;
        assert_eq!(producer.state(), BridgeState::Swallowing);

        // 吞吐阶段即使没有需求也会继续请求读取。
        for _ in 0..3 {
            producer.demand().await.expect("吞吐阶段应继续请求读取");
            producer.on_bytes(b"ignored").await.expect("写入失败");
        }
        assert!(!producer.is_aborted());
        producer.on_complete(b"").await.expect("完成信号失败");
        settle().await;

        let record = record.lock();
        assert_eq!(record.chunks.len(), 1);
        assert!(!record.completed);
        assert_eq!(consumer.state(), BridgeState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn swallow_deadline_force_closes_the_producer() {
        let bridge = BackpressureBridge::new(
            BridgeConfig::new().with_max_swallow_duration(Duration::from_millis(50)),
        );
        let (mut producer, consumer) = bridge.open();
        drop(consumer);

        producer.demand().await.expect("吞吐阶段应请求读取");
        producer.on_bytes(b"slow").await.expect("写入失败");
        tokio::time::timeout(Duration::from_secs(1), producer.aborted())
            .await
            .expect("吞吐超时后生产方必须被中止");
        assert!(producer.demand().await.is_err());
        assert_eq!(producer.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn close_immediately_policy_aborts_on_cancel() {
        let bridge =
            BackpressureBridge::new(BridgeConfig::new().with_cancel_policy(CancelPolicy::CloseImmediately));
        let (producer, consumer) = bridge.open();
        consumer.cancel();
        tokio::time::timeout(Duration::from_secs(1), producer.aborted())
            .await
            .expect("立即关闭策略必须中止生产方");
        let (late, _) = recorder(1);
        assert!(matches!(
            consumer.subscribe(late),
            Err(StreamError::AlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn completion_before_subscription_is_held_for_the_subscriber() {
        let (producer, consumer) = BackpressureBridge::default().open();
        producer.on_complete(b"tail").await.expect("完成信号失败");
        settle().await;
        assert_eq!(consumer.state(), BridgeState::AwaitingSubscriber);

        let (subscriber, record) = recorder(4);
        consumer.subscribe(subscriber).expect("订阅失败");
        settle().await;
        let record = record.lock();
        assert_eq!(record.chunks, vec![Bytes::from_static(b"tail")]);
        assert!(record.completed);
    }
}
