use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver};

/// 默认准入上限：纯粹用于背压，不代表线程数
pub const DEFAULT_CAPACITY: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool saturated ({capacity} tasks admitted)")]
    Saturated { capacity: usize },
    #[error("worker pool closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task panicked")]
    Panicked,
    #[error("task dropped before producing a result")]
    Disconnected,
}

/// 有界 WorkerPool（类 Spark executor slot）
///
/// - 固定数量的 rayon 线程负责执行；
/// - `capacity` 限制“已准入但未完成”的任务数，超出时 `submit` 立即返回
///   `PoolError::Saturated`，从不阻塞提交方；
/// - 槽位由 `SlotGuard` 在任务结束（含 panic）时归还。
pub struct WorkerPool {
    threads: rayon::ThreadPool,
    capacity: usize,
    running: Arc<AtomicUsize>,
    closed: AtomicBool,
}

struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// `spawn` 返回的结构化 join 句柄
pub struct TaskHandle<T> {
    rx: Receiver<std::thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// 阻塞直到任务结束
    pub fn join(self) -> Result<T, TaskError> {
        match self.rx.recv() {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(TaskError::Panicked),
            Err(_) => Err(TaskError::Disconnected),
        }
    }
}

/// 已占用的执行槽位；drop 而不使用时归还
pub struct Reservation<'a> {
    pool: &'a WorkerPool,
    slot: SlotGuard,
}

impl<'a> Reservation<'a> {
    pub fn submit<F>(self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = self.slot;
        self.pool.threads.spawn(move || {
            let _slot = slot;
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::warn!("Submitted task panicked");
            }
        });
    }

    pub fn spawn<T, F>(self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = self.slot;
        let (tx, rx) = bounded(1);
        self.pool.threads.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(task));
            drop(slot);
            // join 方可能已放弃等待
            let _ = tx.send(result);
        });
        TaskHandle { rx }
    }
}

impl WorkerPool {
    pub fn new(capacity: usize, workers: usize) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("solitudes-worker-{}", i))
            .panic_handler(|_| tracing::error!("Worker task panicked outside of a guarded section"))
            .build()?;

        tracing::debug!("WorkerPool ready: capacity={}, workers={}", capacity, workers);
        Ok(Self {
            threads,
            capacity: capacity.max(1),
            running: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    /// capacity = DEFAULT_CAPACITY，workers = CPU 数
    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::new(DEFAULT_CAPACITY, num_cpus::get())
    }

    /// fire-and-forget 提交；饱和时同步返回错误，调用方负责回滚自己的计数。
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reserve()?.submit(task);
        Ok(())
    }

    /// 提交并返回可 join 的句柄（结构化并发）
    pub fn spawn<T, F>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Ok(self.reserve()?.spawn(task))
    }

    /// 先占槽位再交出任务：失败时任务仍在调用方手里，可以改为同步执行
    pub fn reserve(&self) -> Result<Reservation<'_>, PoolError> {
        Ok(Reservation {
            pool: self,
            slot: self.acquire()?,
        })
    }

    /// 关闭后拒绝新任务，已准入的任务照常完成
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.running())
    }

    fn acquire(&self) -> Result<SlotGuard, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let cap = self.capacity;
        self.running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < cap {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| PoolError::Saturated { capacity: cap })?;
        Ok(SlotGuard(self.running.clone()))
    }
}
