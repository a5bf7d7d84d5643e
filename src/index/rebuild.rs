use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::analyzer::AnalyzerConfig;
use super::document::IndexableRecord;
use super::handle::IndexHandle;
use super::text::TextIndex;
use crate::core::pool::{TaskHandle, WorkerPool};
use crate::stats::RebuildReport;
use crate::storage::{IndexRoot, RecordStore};

/// 单条记录写入失败时的处理策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFailurePolicy {
    /// 整次重建失败，旧索引保持不变（一致性优先）
    #[default]
    Abort,
    /// 跳过并记入报告（可用性优先）
    Skip,
}

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("a rebuild is already in progress")]
    InProgress,
    #[error("record store fetch failed: {0:#}")]
    Store(anyhow::Error),
    #[error("index error: {0:#}")]
    Index(anyhow::Error),
    #[error("failed to index record {id}: {cause:#}")]
    Record { id: String, cause: anyhow::Error },
}

type SwapHook = Box<dyn Fn() + Send + Sync>;

/// 全量重建流水线（影子索引 + 原子切换）
///
/// 1. 同一时刻只允许一次重建，并发触发直接返回 `InProgress`；
/// 2. 主记录与历史记录通过 WorkerPool 并行拉取，两者都结束后才进入下一步；
///    池拒绝时退化为当前线程同步拉取，记入 `degraded_fetches`；
/// 3. 在新的 generation 目录建空索引，重新注册同一份 analyzer；
/// 4. 逐条串行写入（索引 writer 不假设并发安全）；
/// 5. commit → COMPLETE → CURRENT → 切换句柄 → 关闭并删除旧一代。
///
/// 第 5 步之前的任何失败都会删除半成品目录，旧索引和 CURRENT 不受影响；
/// 读者在整个过程中一直拿得到旧索引。
pub struct Rebuilder {
    root: IndexRoot,
    handle: Arc<IndexHandle>,
    store: Arc<dyn RecordStore>,
    pool: Arc<WorkerPool>,
    analyzer: AnalyzerConfig,
    policy: RecordFailurePolicy,
    running: AtomicBool,
    on_swap: Vec<SwapHook>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 未发布的 generation：除非 `disarm`，drop 时删除目录
struct Unpublished<'a> {
    root: &'a IndexRoot,
    generation: u64,
    armed: bool,
}

impl Unpublished<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Unpublished<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.root.remove_generation(self.generation) {
            Ok(()) => tracing::warn!("Discarded incomplete index generation {}", self.generation),
            Err(e) => tracing::error!(
                "Failed to remove incomplete index generation {}: {}",
                self.generation,
                e
            ),
        }
    }
}

enum Fetch<T> {
    Pooled(TaskHandle<anyhow::Result<T>>),
    Inline(anyhow::Result<T>),
}

impl<T> Fetch<T> {
    fn join(self, what: &str) -> Result<T, RebuildError> {
        let result = match self {
            Fetch::Pooled(task) => task
                .join()
                .map_err(|e| anyhow::anyhow!("{} fetch task failed: {}", what, e))
                .and_then(|r| r),
            Fetch::Inline(r) => r,
        };
        result.map_err(RebuildError::Store)
    }
}

impl Rebuilder {
    pub fn new(
        root: IndexRoot,
        handle: Arc<IndexHandle>,
        store: Arc<dyn RecordStore>,
        pool: Arc<WorkerPool>,
        analyzer: AnalyzerConfig,
    ) -> Self {
        Self {
            root,
            handle,
            store,
            pool,
            analyzer,
            policy: RecordFailurePolicy::default(),
            running: AtomicBool::new(false),
            on_swap: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: RecordFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 句柄切换后立即执行（例如清空由旧索引派生的缓存）
    pub fn on_swap(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_swap.push(Box::new(hook));
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn rebuild(&self) -> Result<RebuildReport, RebuildError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Rebuild requested while another rebuild is running, rejecting");
            return Err(RebuildError::InProgress);
        }
        let _running = RunningGuard(&self.running);

        let started = Instant::now();
        tracing::info!("Starting full-text index rebuild");
        let mut report = RebuildReport::default();

        let articles = self.start_fetch("primary", &mut report.degraded_fetches, |s| s.find_all());
        let histories = self.start_fetch("historical", &mut report.degraded_fetches, |s| {
            s.find_all_with_parent()
        });
        // 两个拉取都结束后再处理错误，不留悬空任务
        let articles = articles.join("primary");
        let histories = histories.join("historical");
        let (articles, histories) = (articles?, histories?);
        report.primary_records = articles.len();
        report.historical_records = histories.len();
        tracing::info!(
            "Fetched {} primary and {} historical records",
            articles.len(),
            histories.len()
        );

        let (generation, dir) = self.root.next_generation().map_err(RebuildError::Index)?;
        let unpublished = Unpublished {
            root: &self.root,
            generation,
            armed: true,
        };
        let next = TextIndex::create(&dir, &self.analyzer).map_err(RebuildError::Index)?;

        let records = articles
            .iter()
            .map(IndexableRecord::from)
            .chain(histories.iter().map(IndexableRecord::from));
        let mut seen = HashSet::with_capacity(articles.len() + histories.len());
        for record in records {
            // 同 ID 会被 upsert 合并，必须按单条失败处理，否则索引静默少一篇
            let outcome = if seen.insert(record.id.clone()) {
                next.index(&record)
            } else {
                Err(anyhow::anyhow!("duplicate index id {}", record.id))
            };
            match outcome {
                Ok(()) => report.indexed += 1,
                Err(e) => match self.policy {
                    RecordFailurePolicy::Abort => {
                        tracing::error!("Indexing {} failed, aborting rebuild: {:#}", record.id, e);
                        return Err(RebuildError::Record {
                            id: record.id,
                            cause: e,
                        });
                    }
                    RecordFailurePolicy::Skip => {
                        tracing::warn!("Indexing {} failed, skipping: {:#}", record.id, e);
                        report.skipped.push(record.id);
                    }
                },
            }
        }

        next.commit().map_err(RebuildError::Index)?;
        IndexRoot::mark_complete(&dir).map_err(RebuildError::Index)?;
        self.root.publish(generation).map_err(RebuildError::Index)?;
        unpublished.disarm();

        let next = Arc::new(next);
        let old = self.handle.swap(next.clone());
        for hook in &self.on_swap {
            hook();
        }

        if let Err(e) = old.close() {
            tracing::warn!("Failed to close replaced index: {}", e);
        }
        report.replaced = old.generation();
        if let Some(g) = report.replaced.filter(|g| *g != generation) {
            if let Err(e) = self.root.remove_generation(g) {
                tracing::warn!("Failed to remove replaced generation {}: {}", g, e);
            }
        }
        drop(old);
        maybe_trim_rss();

        report.generation = generation;
        report.doc_count = next.doc_count();
        report.elapsed = started.elapsed();
        if report.is_degraded() {
            tracing::warn!(
                "Rebuild finished degraded: {} skipped records, {} synchronous fetches",
                report.skipped.len(),
                report.degraded_fetches
            );
        }
        tracing::info!(
            "Rebuild complete: generation {} with {} docs in {:.2?}",
            generation,
            report.doc_count,
            report.elapsed
        );
        Ok(report)
    }

    fn start_fetch<T, F>(&self, what: &str, degraded: &mut usize, fetch: F) -> Fetch<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        match self.pool.reserve() {
            Ok(slot) => Fetch::Pooled(slot.spawn(move || fetch(store.as_ref()))),
            Err(e) => {
                *degraded += 1;
                tracing::warn!(
                    "WorkerPool rejected {} fetch ({}), fetching synchronously",
                    what,
                    e
                );
                Fetch::Inline(fetch(store.as_ref()))
            }
        }
    }
}

#[cfg(feature = "mimalloc")]
fn maybe_trim_rss() {
    // mimalloc 作为全局分配器时 malloc_trim 无效，调用 mimalloc 自己的回收
    extern "C" {
        fn mi_collect(force: bool);
    }
    unsafe { mi_collect(true) };
}

#[cfg(all(not(feature = "mimalloc"), target_os = "linux", target_env = "gnu"))]
fn maybe_trim_rss() {
    // 旧一代索引的缓冲区刚释放，主动回吐给 OS
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(all(
    not(feature = "mimalloc"),
    not(all(target_os = "linux", target_env = "gnu"))
))]
fn maybe_trim_rss() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{HistoricalRecord, MemoryStore, PrimaryRecord};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("solitudes-{}-{}", tag, nanos))
    }

    fn article(id: &str, title: &str, content: &str, version: u32) -> PrimaryRecord {
        PrimaryRecord {
            id: id.to_string(),
            slug: id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            tags: vec![],
            version,
            updated_at: 0,
        }
    }

    fn history(parent_id: &str, version: u32, content: &str) -> HistoricalRecord {
        HistoricalRecord {
            parent_id: parent_id.to_string(),
            version,
            content: content.to_string(),
            created_at: 0,
            parent: None,
        }
    }

    /// 3 篇文章 + 2 条历史版本
    fn sample_store() -> MemoryStore {
        MemoryStore::new(
            vec![
                article("a", "Apple", "red fruit", 2),
                article("b", "Banana", "yellow fruit", 1),
                article("c", "Cherry", "small fruit", 3),
            ],
            vec![history("a", 1, "green fruit"), history("c", 2, "sour fruit")],
        )
    }

    struct Fixture {
        root: IndexRoot,
        handle: Arc<IndexHandle>,
    }

    fn fixture(tag: &str) -> Fixture {
        let root = IndexRoot::new(unique_tmp_dir(tag));
        let handle =
            Arc::new(IndexHandle::open_or_init(&root, &AnalyzerConfig::simple()).unwrap());
        Fixture { root, handle }
    }

    fn rebuilder(f: &Fixture, store: Arc<dyn RecordStore>, pool: WorkerPool) -> Rebuilder {
        Rebuilder::new(
            f.root.clone(),
            f.handle.clone(),
            store,
            Arc::new(pool),
            AnalyzerConfig::simple(),
        )
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(16, 2).unwrap()
    }

    /// find_all 阻塞固定时长，用于观察重建过程中的外部行为
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl RecordStore for SlowStore {
        fn find_all(&self) -> anyhow::Result<Vec<PrimaryRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.find_all()
        }

        fn find_all_with_parent(&self) -> anyhow::Result<Vec<HistoricalRecord>> {
            self.inner.find_all_with_parent()
        }
    }

    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn find_all(&self) -> anyhow::Result<Vec<PrimaryRecord>> {
            Ok(vec![article("a", "A", "a", 1)])
        }

        fn find_all_with_parent(&self) -> anyhow::Result<Vec<HistoricalRecord>> {
            anyhow::bail!("connection reset")
        }
    }

    #[test]
    fn rebuild_indexes_every_record_once() {
        let f = fixture("rebuild-basic");
        let r = rebuilder(&f, Arc::new(sample_store()), pool());

        let report = r.rebuild().unwrap();
        assert_eq!(report.doc_count, 5);
        assert_eq!(report.indexed, 5);
        assert_eq!(report.primary_records, 3);
        assert_eq!(report.historical_records, 2);
        assert_eq!(report.replaced, Some(1));
        assert_eq!(report.generation, 2);
        assert!(!report.is_degraded());

        let idx = f.handle.load();
        assert_eq!(idx.doc_count(), 5);
        for id in ["a.2", "b.1", "c.3", "a.1", "c.2"] {
            assert!(idx.get(id).unwrap().is_some(), "missing {}", id);
        }
    }

    #[test]
    fn every_primary_record_is_addressable() {
        let f = fixture("rebuild-roundtrip");
        let store = Arc::new(sample_store());
        rebuilder(&f, store.clone(), pool()).rebuild().unwrap();

        let idx = f.handle.load();
        for a in store.find_all().unwrap() {
            let got = idx.get(&format!("{}.{}", a.id, a.version)).unwrap().unwrap();
            assert_eq!(got.title, a.title);
            assert_eq!(got.content, a.content);
        }
    }

    #[test]
    fn rebuild_twice_yields_same_count_and_cleans_old_generation() {
        let f = fixture("rebuild-twice");
        let r = rebuilder(&f, Arc::new(sample_store()), pool());

        let first = r.rebuild().unwrap();
        let second = r.rebuild().unwrap();
        assert_eq!(first.doc_count, second.doc_count);
        assert_eq!(second.replaced, Some(first.generation));

        assert!(!f.root.generation_dir(first.generation).exists());
        assert!(f.root.generation_dir(second.generation).exists());
        assert_eq!(
            f.root.current().unwrap().map(|(g, _)| g),
            Some(second.generation)
        );
    }

    #[test]
    fn fetch_failure_keeps_old_index() {
        let f = fixture("rebuild-fetch-fail");
        rebuilder(&f, Arc::new(sample_store()), pool())
            .rebuild()
            .unwrap();
        let before = f.handle.generation();

        let err = rebuilder(&f, Arc::new(BrokenStore), pool())
            .rebuild()
            .unwrap_err();
        assert!(matches!(err, RebuildError::Store(_)));
        assert!(err.to_string().contains("connection reset"));

        assert_eq!(f.handle.generation(), before);
        assert_eq!(f.handle.doc_count(), 5);
        assert_eq!(f.root.current().unwrap().map(|(g, _)| g), before);
    }

    #[test]
    fn abort_policy_discards_partial_generation() {
        let f = fixture("rebuild-abort");
        let store = sample_store();
        store.insert_article(article("", "no id", "broken", 1));
        let before = f.handle.generation();

        let err = rebuilder(&f, Arc::new(store), pool())
            .rebuild()
            .unwrap_err();
        match err {
            RebuildError::Record { id, .. } => assert_eq!(id, ".1"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(f.handle.generation(), before);
        // 半成品目录已删除
        assert!(!f.root.generation_dir(before.unwrap() + 1).exists());
    }

    #[test]
    fn skip_policy_reports_skipped_records() {
        let f = fixture("rebuild-skip");
        let store = sample_store();
        store.insert_article(article("", "no id", "broken", 1));

        let report = rebuilder(&f, Arc::new(store), pool())
            .with_policy(RecordFailurePolicy::Skip)
            .rebuild()
            .unwrap();
        assert_eq!(report.skipped, vec![".1".to_string()]);
        assert_eq!(report.doc_count, 5);
        assert!(report.is_degraded());
    }

    #[test]
    fn colliding_ids_abort_by_default() {
        let f = fixture("rebuild-dup-abort");
        let before = f.handle.generation();
        let store = MemoryStore::new(
            vec![article("a", "Apple", "red fruit", 2)],
            vec![history("a", 2, "same version as the article")],
        );

        let err = rebuilder(&f, Arc::new(store), pool())
            .rebuild()
            .unwrap_err();
        match err {
            RebuildError::Record { id, .. } => assert_eq!(id, "a.2"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(f.handle.generation(), before);
    }

    #[test]
    fn colliding_ids_are_reported_when_skipping() {
        let f = fixture("rebuild-dup-skip");
        let store = sample_store();
        store.insert_history(history("b", 1, "duplicate of the current version"));

        let report = rebuilder(&f, Arc::new(store), pool())
            .with_policy(RecordFailurePolicy::Skip)
            .rebuild()
            .unwrap();
        assert_eq!(report.indexed, 5);
        assert_eq!(report.doc_count, 5);
        assert_eq!(report.skipped, vec!["b.1".to_string()]);
        assert!(report.is_degraded());
        assert_eq!(report.indexed as u64, report.doc_count);
    }

    #[test]
    fn saturated_pool_fetches_synchronously() {
        let f = fixture("rebuild-saturated");
        let pool = WorkerPool::new(1, 1).unwrap();
        let pool = Arc::new(pool);
        let _held = pool.reserve().unwrap();

        let r = Rebuilder::new(
            f.root.clone(),
            f.handle.clone(),
            Arc::new(sample_store()),
            pool.clone(),
            AnalyzerConfig::simple(),
        );
        let report = r.rebuild().unwrap();
        assert_eq!(report.degraded_fetches, 2);
        assert_eq!(report.doc_count, 5);
    }

    #[test]
    fn concurrent_trigger_is_rejected() {
        let f = fixture("rebuild-concurrent");
        let store = Arc::new(SlowStore {
            inner: sample_store(),
            delay: Duration::from_millis(300),
            calls: AtomicUsize::new(0),
        });
        let r = Arc::new(rebuilder(&f, store.clone(), pool()));

        let first = {
            let r = r.clone();
            std::thread::spawn(move || r.rebuild())
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !r.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(matches!(r.rebuild(), Err(RebuildError::InProgress)));
        assert!(first.join().unwrap().is_ok());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(!r.is_running());
        assert!(r.rebuild().is_ok());
    }

    #[test]
    fn readers_keep_old_index_until_swap() {
        let f = fixture("rebuild-availability");
        let seed = MemoryStore::new(vec![article("old", "Old", "legacy post", 1)], vec![]);
        rebuilder(&f, Arc::new(seed), pool()).rebuild().unwrap();
        assert_eq!(f.handle.doc_count(), 1);

        let store = Arc::new(SlowStore {
            inner: sample_store(),
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
        });
        let swapped = Arc::new(AtomicBool::new(false));
        let r = {
            let swapped = swapped.clone();
            Arc::new(
                rebuilder(&f, store, pool())
                    .on_swap(move || swapped.store(true, Ordering::SeqCst)),
            )
        };

        let held = f.handle.load();
        let worker = {
            let r = r.clone();
            std::thread::spawn(move || r.rebuild())
        };

        // 重建进行中：读者始终拿得到旧索引
        while !swapped.load(Ordering::SeqCst) && !worker.is_finished() {
            let idx = f.handle.load();
            if idx.generation() == held.generation() {
                assert_eq!(idx.doc_count(), 1);
                assert_eq!(idx.search("legacy", 5).unwrap().len(), 1);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.join().unwrap().unwrap();

        // 已持有的旧句柄仍可读
        assert_eq!(held.doc_count(), 1);
        assert_eq!(f.handle.doc_count(), 5);
        assert_eq!(f.handle.load().search("legacy", 5).unwrap().len(), 0);
    }

    #[test]
    fn open_or_init_reopens_published_generation() {
        let f = fixture("rebuild-reopen");
        let report = rebuilder(&f, Arc::new(sample_store()), pool())
            .rebuild()
            .unwrap();
        // 模拟崩溃遗留的半成品
        std::fs::create_dir_all(f.root.generation_dir(report.generation + 1)).unwrap();
        // 释放目录锁，模拟进程重启
        f.handle.load().close().unwrap();

        let reopened = IndexHandle::open_or_init(&f.root, &AnalyzerConfig::simple()).unwrap();
        assert_eq!(reopened.generation(), Some(report.generation));
        assert_eq!(reopened.doc_count(), 5);
        assert!(!f.root.generation_dir(report.generation + 1).exists());
    }
}
