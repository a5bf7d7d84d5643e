use std::sync::Arc;

use anyhow::Context as _;

use crate::cache::{CacheError, ExpiringCache, SafeCache};
use crate::config::Config;
use crate::core::pool::WorkerPool;
use crate::index::{IndexHandle, RebuildError, Rebuilder, SearchHit};
use crate::stats::{RebuildReport, SafeCacheStats};
use crate::storage::{IndexRoot, RecordStore};

pub type SearchResults = Arc<Vec<SearchHit>>;

/// 装配好的运行时上下文：配置、记录源、缓存、索引句柄、WorkerPool
///
/// 组件之间只通过这里注入的 `Arc` 共享，没有全局可变状态。
pub struct Context {
    config: Config,
    pool: Arc<WorkerPool>,
    cache: Arc<SafeCache<SearchResults>>,
    index: Arc<IndexHandle>,
    rebuilder: Rebuilder,
}

impl Context {
    /// 索引无法打开也无法创建时返回错误，进程不应继续
    pub fn bootstrap(config: Config, store: Arc<dyn RecordStore>) -> anyhow::Result<Self> {
        let pool = Arc::new(
            WorkerPool::new(config.pool.capacity, config.pool.workers)
                .context("start worker pool")?,
        );

        let expiring = Arc::new(ExpiringCache::new(
            config.cache.ttl(),
            config.cache.sweep_interval(),
        ));
        let cache = Arc::new(SafeCache::new(expiring).with_pool(pool.clone()));

        let root = IndexRoot::new(config.index_path.clone());
        let index = Arc::new(
            IndexHandle::open_or_init(&root, &config.analyzer).with_context(|| {
                format!("open full-text index at {}", config.index_path.display())
            })?,
        );
        tracing::info!(
            "Full-text index ready: generation {:?}, {} docs",
            index.generation(),
            index.doc_count()
        );

        let flush = cache.clone();
        let rebuilder = Rebuilder::new(root, index.clone(), store, pool.clone(), config.analyzer)
            .with_policy(config.rebuild.on_record_failure)
            .on_swap(move || flush.flush());

        Ok(Self {
            config,
            pool,
            cache,
            index,
            rebuilder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<SafeCache<SearchResults>> {
        &self.cache
    }

    /// 经 SafeCache 的检索：相同查询并发到达时只查一次索引
    pub fn search(&self, query: &str, limit: usize) -> Result<SearchResults, CacheError> {
        let key = format!("search:{}:{}", limit, query);
        let index = self.index.clone();
        let query = query.to_string();
        self.cache.get_or_compute(&key, move || {
            let hits = index.load().search(&query, limit)?;
            Ok(Arc::new(hits))
        })
    }

    pub fn doc_count(&self) -> u64 {
        self.index.doc_count()
    }

    /// 运维入口：从记录源全量重建索引
    pub fn rebuild_index(&self) -> Result<RebuildReport, RebuildError> {
        self.rebuilder.rebuild()
    }

    pub fn cache_stats(&self) -> SafeCacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::AnalyzerConfig;
    use crate::storage::{MemoryStore, PrimaryRecord};
    use std::path::PathBuf;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("solitudes-{}-{}", tag, nanos))
    }

    fn config(tag: &str) -> Config {
        let mut c = Config::default();
        c.index_path = unique_tmp_dir(tag);
        c.analyzer = AnalyzerConfig::simple();
        c.cache.sweep_interval_secs = 0;
        c.pool.capacity = 64;
        c.pool.workers = 2;
        c
    }

    fn post(id: &str, title: &str, content: &str) -> PrimaryRecord {
        PrimaryRecord {
            id: id.to_string(),
            slug: id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            tags: vec![],
            version: 1,
            updated_at: 0,
        }
    }

    #[test]
    fn bootstrap_creates_empty_index() {
        let ctx = Context::bootstrap(config("ctx-empty"), Arc::new(MemoryStore::default())).unwrap();
        assert_eq!(ctx.doc_count(), 0);
        assert_eq!(ctx.index().generation(), Some(1));
    }

    #[test]
    fn bootstrap_fails_on_unusable_index_path() {
        let file = unique_tmp_dir("ctx-file");
        std::fs::write(&file, b"not a directory").unwrap();
        let mut c = config("ctx-unused");
        c.index_path = file;
        assert!(Context::bootstrap(c, Arc::new(MemoryStore::default())).is_err());
    }

    #[test]
    fn rebuild_flushes_cached_search_results() {
        let store = Arc::new(MemoryStore::new(vec![post("a", "Hello", "first post")], vec![]));
        let ctx = Context::bootstrap(config("ctx-flush"), store.clone()).unwrap();
        ctx.rebuild_index().unwrap();

        assert_eq!(ctx.search("post", 10).unwrap().len(), 1);
        store.insert_article(post("b", "World", "second post"));
        // 命中缓存：仍是旧结果
        assert_eq!(ctx.search("post", 10).unwrap().len(), 1);

        let report = ctx.rebuild_index().unwrap();
        assert_eq!(report.doc_count, 2);
        assert_eq!(ctx.search("post", 10).unwrap().len(), 2);
        assert!(ctx.cache_stats().hits >= 1);
    }
}
