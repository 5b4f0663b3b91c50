#![cfg(not(loom))]
//! `body_roundtrip` 集成测试：分片边界不得影响消息体内容。
//!
//! # 测试目标（Why）
//! - 传输层按套接字读到的任意长度切分消息体，多字节 UTF-8 字符可能被切在两个分片之间；
//!   无论经“完整物化”还是“流式复制”，读回的字节都必须与原文一致。
//!
//! # 结构安排（How）
//! - 随机生成可打印文本与切分点，构造分片流；
//! - 分别走 `DataStream::from_stream → as_string` 与 `BackpressureBridge::pipe → write_to` 两条路径。

use bytes::Bytes;
use flare_stream::{BackpressureBridge, DataStream};
use futures_util::stream;
use proptest::prelude::*;
use proptest::sample::Index;

fn split_at_points(bytes: &[u8], cuts: &[Index]) -> Vec<Bytes> {
    let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(bytes.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();
    let mut chunks = Vec::new();
    let mut start = 0;
    for point in points {
        if point > start {
            chunks.push(Bytes::copy_from_slice(&bytes[start..point]));
            start = point;
        }
    }
    if start < bytes.len() {
        chunks.push(Bytes::copy_from_slice(&bytes[start..]));
    }
    chunks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn chunk_boundaries_preserve_bytes(
        text in "\\PC{0,48}",
        cuts in prop::collection::vec(any::<Index>(), 0..8),
    ) {
        let bytes = text.as_bytes().to_vec();
        let chunks = split_at_points(&bytes, &cuts);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("构建测试运行时失败");

        let (materialized, copied) = runtime.block_on(async {
            let direct = DataStream::from_stream(
                stream::iter(chunks.clone().into_iter().map(Ok)),
                Some(bytes.len() as u64),
            );
            let materialized = direct.as_string().await.expect("物化失败");

            let consumer = BackpressureBridge::default()
                .pipe(stream::iter(chunks.into_iter().map(Ok)));
            let bridged = DataStream::from_bridge(consumer, None);
            let mut copied = Vec::new();
            bridged.write_to(&mut copied).await.expect("流式复制失败");
            (materialized, copied)
        });

        prop_assert_eq!(materialized, text);
        prop_assert_eq!(copied, bytes);
    }
}
