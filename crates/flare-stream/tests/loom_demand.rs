#![cfg(loom)]

use flare_stream::DemandCounter;
use loom::{model, sync::Arc, thread};

#[test]
fn concurrent_requests_are_never_lost() {
    //
    // 教案级说明：两个订阅线程同时 `request`，驱动线程同时 `take`。
    // - **Why**：需求丢失会让生产方永远等不到读取指令，消息体因此挂起；
    // - **How**：Loom 穷举 CAS 循环与 `swap` 的所有交错；
    // - **What**：所有 `take` 之和加剩余值必须等于所有 `add` 之和。
    model(|| {
        let counter = Arc::new(DemandCounter::new());
        let first = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                counter.add(2);
            })
        };
        let second = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                counter.add(3);
            })
        };
        let early = counter.take();
        first.join().expect("请求线程不应 panic");
        second.join().expect("请求线程不应 panic");
        assert_eq!(early + counter.take(), 5);
    });
}

#[test]
fn contended_requests_saturate_at_the_upper_bound() {
    model(|| {
        let counter = Arc::new(DemandCounter::new());
        let big = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                counter.add(u64::MAX - 1);
            })
        };
        counter.add(5);
        big.join().expect("请求线程不应 panic");
        assert_eq!(counter.take(), u64::MAX);
    });
}
