// 启用 `--cfg loom` 时切换到 Loom 的原子类型，让模型检查覆盖所有调度交错。
#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

/// 饱和累加的需求计数器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - `Subscription::request` 可能在任意线程被并发调用，累计值必须既不丢失也不溢出；
/// - 驱动任务只关心“自上次以来新增了多少需求”，因此提供 `take` 一次性取走。
///
/// ## 逻辑 (How)
/// - `add` 以 CAS 循环执行 `saturating_add`，到达 `u64::MAX` 后停留在上限，
///   语义等同于“无限需求”；
/// - `take` 通过 `swap(0)` 原子地取走累计值。
///
/// ## 契约 (What)
/// - 任意并发交错下，所有 `take` 返回值之和加上剩余值等于所有 `add` 之和（饱和前）；
/// - **后置条件**：计数永不回绕。
#[derive(Debug)]
pub struct DemandCounter {
    pending: AtomicU64,
}

impl Default for DemandCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl DemandCounter {
    pub fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
        }
    }

    /// 饱和累加 `n`，返回累加后的值。
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n);
            match self.pending.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// 取走当前累计值并清零。
    pub fn take(&self) -> u64 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    pub fn get(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::DemandCounter;

    #[test]
    fn add_saturates_instead_of_wrapping() {
        let counter = DemandCounter::new();
        counter.add(u64::MAX - 1);
        assert_eq!(counter.add(5), u64::MAX);
        assert_eq!(counter.take(), u64::MAX);
        assert_eq!(counter.get(), 0);
    }
}
