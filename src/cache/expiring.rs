use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct Entry<V> {
    value: V,
    /// None = 永不过期（ttl 超出 Instant 可表示范围）
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Store<V> {
    items: DashMap<String, Entry<V>>,
    default_ttl: Duration,
}

impl<V> Store<V> {
    fn delete_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.items.len();
        self.items.retain(|_, e| !e.expired(now));
        before.saturating_sub(self.items.len())
    }
}

struct Sweeper {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// TTL 缓存（DashMap 分片锁）
///
/// - 过期条目对 `get` 立即不可见，物理删除交给后台 sweeper；
/// - sweeper 只持有 `Weak`，cache drop 后线程自动退出；
/// - 单 key 替换是一次 insert，读方不会看到写了一半的值。
pub struct ExpiringCache<V> {
    store: Arc<Store<V>>,
    sweeper: Sweeper,
}

impl<V> ExpiringCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// `sweep_interval` 为零时不启动 sweeper
    pub fn new(default_ttl: Duration, sweep_interval: Duration) -> Self {
        let store = Arc::new(Store {
            items: DashMap::new(),
            default_ttl,
        });
        let sweeper = if sweep_interval.is_zero() {
            Sweeper {
                stop: None,
                thread: None,
            }
        } else {
            spawn_sweeper(Arc::downgrade(&store), sweep_interval)
        };
        Self { store, sweeper }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.store.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.store.items.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.store.items.get(key)?;
        if entry.expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn delete(&self, key: &str) {
        self.store.items.remove(key);
    }

    /// 存活条目数（不含已过期但尚未清扫的）
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.store.items.iter().filter(|e| !e.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) {
        self.store.items.clear();
    }

    /// 单次清扫，返回删除条数
    pub fn delete_expired(&self) -> usize {
        self.store.delete_expired()
    }

    pub fn default_ttl(&self) -> Duration {
        self.store.default_ttl
    }
}

fn spawn_sweeper<V>(store: Weak<Store<V>>, interval: Duration) -> Sweeper
where
    V: Send + Sync + 'static,
{
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let thread = std::thread::Builder::new()
        .name("solitudes-cache-sweeper".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(store) = store.upgrade() else { break };
                    let removed = store.delete_expired();
                    if removed > 0 {
                        tracing::debug!("Cache sweep removed {} expired entries", removed);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

    match thread {
        Ok(handle) => Sweeper {
            stop: Some(stop_tx),
            thread: Some(handle),
        },
        Err(e) => {
            tracing::warn!("Failed to spawn cache sweeper, expired entries stay until overwritten: {}", e);
            Sweeper {
                stop: None,
                thread: None,
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        // 断开 channel 即可唤醒 sweeper
        self.stop.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
