#![doc = r#"
# flare-stream

## 设计动机（Why）
- **定位**：为传输层提供统一的“消息体”抽象 [`DataStream`]，以及把网络驱动的
  推送式读取转换为消费者驱动的拉取式需求的 [`BackpressureBridge`]。
- **架构角色**：不依赖任何网络实现；`flare-transport` 在客户端读取响应体时使用它，
  服务端读取请求体时同样可以直接复用。
- **设计理念**：内存中的字节可重复读取，来自套接字的数据只能消费一次；推送方永远
  不能越过消费者声明的需求。

## 核心契约（What）
- [`DataStream`]：可重放 / 单次消费两类来源，`content_length()` 以 `-1` 表示未知；
- [`BackpressureBridge`]：`Idle → AwaitingSubscriber → Streaming → Swallowing → Closed`
  显式状态机，累计投递数永不超过累计需求，分片按 FIFO 顺序到达；
- [`Subscriber`] / [`Subscription`]：拉取协议，`request(n ≤ 0)` 显式报错。

## 实现策略（How）
- 桥的所有状态由单一驱动任务持有，生产方事件经有界通道送达，消费方控制信号经
  原子计数 + `Notify` 唤醒驱动任务；
- 投递发生在驱动任务上，不会占用生产方的 IO 任务，也不会出现
  `request → on_next → request` 的递归调用栈。

## 风险与考量（Trade-offs）
- 构造桥时会 `tokio::spawn` 驱动任务，调用方必须处于 Tokio 运行时之内；
- 取消后的“吞掉剩余字节”策略可配置为立即关闭，详见 [`CancelPolicy`]。
"#]

mod bridge;
mod data_stream;
mod demand;
mod error;
mod subscriber;

pub use bridge::{
    BackpressureBridge, BridgeConfig, BridgeConsumer, BridgeProducer, BridgeState, CancelPolicy,
    ProducerAborted,
};
pub use data_stream::{BodyStream, DataStream, UNKNOWN_LENGTH};
pub use demand::DemandCounter;
pub use error::StreamError;
pub use subscriber::{Subscriber, Subscription};
