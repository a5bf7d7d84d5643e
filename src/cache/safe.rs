use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::expiring::ExpiringCache;
use crate::core::pool::{TaskError, WorkerPool};
use crate::stats::SafeCacheStats;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("producer failed: {0:#}")]
    Producer(Arc<anyhow::Error>),
    #[error("producer panicked")]
    Panicked,
    #[error("timed out after {0:?} waiting for in-flight producer")]
    Timeout(Duration),
}

enum FlightState<V> {
    Running,
    Done(Result<V, CacheError>),
}

/// 单 key 的在途计算标记：只在计算期间存在于注册表中
struct Flight<V> {
    state: Mutex<FlightState<V>>,
    done: Condvar,
}

impl<V: Clone> Flight<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Result<V, CacheError>) {
        let mut st = self.state.lock();
        if matches!(*st, FlightState::Running) {
            *st = FlightState::Done(outcome);
        }
        drop(st);
        self.done.notify_all();
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Result<V, CacheError>> {
        let mut st = self.state.lock();
        loop {
            if let FlightState::Done(outcome) = &*st {
                return Some(outcome.clone());
            }
            match deadline {
                Some(d) => {
                    if self.done.wait_until(&mut st, d).timed_out() {
                        if let FlightState::Done(outcome) = &*st {
                            return Some(outcome.clone());
                        }
                        return None;
                    }
                }
                None => self.done.wait(&mut st),
            }
        }
    }
}

enum Role<V> {
    Hit(V),
    Leader(Arc<Flight<V>>, u64),
    Waiter(Arc<Flight<V>>),
}

/// 防击穿缓存（singleflight over ExpiringCache）
///
/// 同一 key 同一时刻至多一个 producer 在跑；其余请求者阻塞在 `Flight` 上，
/// 共享 leader 的结果。注册表锁只覆盖登记/注销，从不覆盖计算本身。
///
/// 失败策略（统一）：producer 出错或 panic 时不写缓存，所有等待者收到同一个
/// 错误；下一次调用视为全新 miss。
pub struct SafeCache<V> {
    cache: Arc<ExpiringCache<V>>,
    flights: Mutex<HashMap<String, Arc<Flight<V>>>>,
    pool: Option<Arc<WorkerPool>>,
    /// 每次 flush 加一；leader 只在 epoch 未变时写缓存
    epoch: Mutex<u64>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    leaders: AtomicU64,
    waiters: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    inline_fallbacks: AtomicU64,
}

/// leader 退出（含 panic）时必定注销 Flight 并广播
struct FlightGuard<'a, V: Clone> {
    owner: &'a SafeCache<V>,
    key: &'a str,
    flight: Arc<Flight<V>>,
    finished: bool,
}

impl<'a, V: Clone> FlightGuard<'a, V> {
    fn finish(mut self, outcome: Result<V, CacheError>) {
        self.release(outcome);
        self.finished = true;
    }

    fn release(&self, outcome: Result<V, CacheError>) {
        {
            let mut flights = self.owner.flights.lock();
            if flights
                .get(self.key)
                .is_some_and(|f| Arc::ptr_eq(f, &self.flight))
            {
                flights.remove(self.key);
            }
        }
        self.flight.complete(outcome);
    }
}

impl<'a, V: Clone> Drop for FlightGuard<'a, V> {
    fn drop(&mut self) {
        if !self.finished {
            self.release(Err(CacheError::Panicked));
        }
    }
}

impl<V> SafeCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: Arc<ExpiringCache<V>>) -> Self {
        Self {
            cache,
            flights: Mutex::new(HashMap::new()),
            pool: None,
            epoch: Mutex::new(0),
            counters: Counters::default(),
        }
    }

    /// producer 改为在 WorkerPool 上执行，leader 阻塞等待；池饱和时回退为当前线程执行
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key)
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.delete(key);
    }

    /// 清空已缓存的值。在途计算照常把结果交给等待者，但不再写入缓存：
    /// 它们可能读的是 flush 之前的数据源。
    pub fn flush(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.cache.flush();
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn get_or_compute<F>(&self, key: &str, producer: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        self.get_or_compute_inner(key, None, producer)
    }

    /// 等待者超时只放弃自己的等待，leader 继续执行并写入缓存
    pub fn get_or_compute_timeout<F>(
        &self,
        key: &str,
        timeout: Duration,
        producer: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        self.get_or_compute_inner(key, Some(timeout), producer)
    }

    pub fn stats(&self) -> SafeCacheStats {
        SafeCacheStats {
            entries: self.cache.len(),
            in_flight: self.in_flight(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            leaders: self.counters.leaders.load(Ordering::Relaxed),
            waiters: self.counters.waiters.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            inline_fallbacks: self.counters.inline_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn get_or_compute_inner<F>(
        &self,
        key: &str,
        timeout: Option<Duration>,
        producer: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        if let Some(v) = self.cache.get(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(v);
        }

        match self.register(key) {
            Role::Hit(v) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(v)
            }
            Role::Waiter(flight) => {
                self.counters.waiters.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache miss for {:?}: waiting on in-flight producer", key);
                self.wait(key, &flight, timeout)
            }
            Role::Leader(flight, epoch) => {
                self.counters.leaders.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache miss for {:?}: running producer", key);
                self.lead(key, flight, epoch, producer)
            }
        }
    }

    fn register(&self, key: &str) -> Role<V> {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get(key) {
            return Role::Waiter(flight.clone());
        }
        // 上一个 leader 可能刚好在我们 miss 与拿锁之间完成：它先写缓存再注销
        if let Some(v) = self.cache.get(key) {
            return Role::Hit(v);
        }
        let epoch = *self.epoch.lock();
        let flight = Arc::new(Flight::new());
        flights.insert(key.to_string(), flight.clone());
        Role::Leader(flight, epoch)
    }

    fn wait(
        &self,
        key: &str,
        flight: &Flight<V>,
        timeout: Option<Duration>,
    ) -> Result<V, CacheError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        match flight.wait(deadline) {
            // 成功时 leader 已先写入缓存；条目若已过期则直接使用 leader 的值
            Some(Ok(v)) => Ok(self.cache.get(key).unwrap_or(v)),
            Some(Err(e)) => Err(e),
            None => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Timeout(timeout.unwrap_or_default()))
            }
        }
    }

    fn lead<F>(
        &self,
        key: &str,
        flight: Arc<Flight<V>>,
        epoch: u64,
        producer: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        let guard = FlightGuard {
            owner: self,
            key,
            flight,
            finished: false,
        };

        let outcome = self.run_producer(producer);
        match &outcome {
            Ok(v) => {
                // 持锁比较并写入，flush 不会插在两者之间
                let current = self.epoch.lock();
                if *current == epoch {
                    self.cache.set(key, v.clone());
                } else {
                    tracing::debug!("Cache flushed while {:?} was in flight, result not cached", key);
                }
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Producer for {:?} failed, nothing cached: {}", key, e);
            }
        }
        guard.finish(outcome.clone());
        outcome
    }

    fn run_producer<F>(&self, producer: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> anyhow::Result<V> + Send + 'static,
    {
        if let Some(pool) = &self.pool {
            match pool.reserve() {
                Ok(slot) => {
                    return match slot.spawn(producer).join() {
                        Ok(Ok(v)) => Ok(v),
                        Ok(Err(e)) => Err(CacheError::Producer(Arc::new(e))),
                        Err(TaskError::Panicked) | Err(TaskError::Disconnected) => {
                            Err(CacheError::Panicked)
                        }
                    };
                }
                Err(e) => {
                    self.counters.inline_fallbacks.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("WorkerPool rejected producer ({}), running inline", e);
                }
            }
        }

        match catch_unwind(AssertUnwindSafe(producer)) {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(CacheError::Producer(Arc::new(e))),
            Err(_) => Err(CacheError::Panicked),
        }
    }
}
