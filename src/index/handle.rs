use std::sync::Arc;

use arc_swap::ArcSwap;

use super::analyzer::AnalyzerConfig;
use super::text::TextIndex;
use crate::storage::IndexRoot;

/// 进程级索引句柄：单写（重建流水线）多读
///
/// 读者 `load()` 拿到的是某一代索引的 `Arc`，重建期间继续可用；
/// 切换只替换指针，从不原地修改正在服务的索引。
pub struct IndexHandle {
    current: ArcSwap<TextIndex>,
}

impl IndexHandle {
    pub fn new(index: TextIndex) -> Self {
        Self {
            current: ArcSwap::from_pointee(index),
        }
    }

    /// 启动路径：打开 CURRENT 指向的一代；不存在时建立空的第一代并发布。
    /// 任何失败都属于启动期致命错误，由调用方上抛。
    pub fn open_or_init(root: &IndexRoot, analyzer: &AnalyzerConfig) -> anyhow::Result<Self> {
        let index = match root.current()? {
            Some((generation, dir)) => {
                let index = TextIndex::open(&dir, analyzer)?.ok_or_else(|| {
                    anyhow::anyhow!("generation {} has no index at {}", generation, dir.display())
                })?;
                tracing::info!("Opened index generation {}", generation);
                index
            }
            None => {
                let (generation, dir) = root.next_generation()?;
                let index = TextIndex::create(&dir, analyzer)?;
                index.commit()?;
                IndexRoot::mark_complete(&dir)?;
                root.publish(generation)?;
                tracing::info!("Created empty index generation {}", generation);
                index
            }
        };

        if let Some(live) = index.generation() {
            if let Err(e) = root.sweep_stale(live) {
                tracing::warn!("Failed to sweep stale index generations: {}", e);
            }
        }
        Ok(Self::new(index))
    }

    pub fn load(&self) -> Arc<TextIndex> {
        self.current.load_full()
    }

    /// 换入新一代，返回旧的一代（由调用方负责 close 与清理磁盘）
    pub fn swap(&self, next: Arc<TextIndex>) -> Arc<TextIndex> {
        self.current.swap(next)
    }

    pub fn doc_count(&self) -> u64 {
        self.current.load().doc_count()
    }

    pub fn generation(&self) -> Option<u64> {
        self.current.load().generation()
    }
}
