use std::io::Write;
use std::path::{Path, PathBuf};

const CURRENT_FILE: &str = "CURRENT";
const COMPLETE_MARKER: &str = "COMPLETE";
const GENERATION_PREFIX: &str = "gen-";

/// 索引根目录：多代 generation + 原子 CURRENT 指针
///
/// 布局：
/// ```text
/// <root>/CURRENT            "gen-000003\n"
/// <root>/gen-000003/        tantivy 文件 + COMPLETE 标记
/// <root>/gen-000004/        重建中（无 COMPLETE，崩溃后由 sweep_stale 清理）
/// ```
///
/// 切换流程沿用快照的原子替换：写 CURRENT.tmp → fsync → rename → fsync(dir)。
/// 只有带 COMPLETE 标记的 generation 才会被 CURRENT 指向。
#[derive(Clone, Debug)]
pub struct IndexRoot {
    root: PathBuf,
}

pub fn generation_name(generation: u64) -> String {
    format!("{}{:06}", GENERATION_PREFIX, generation)
}

/// `.../gen-000003` → Some(3)
pub fn generation_of(dir: &Path) -> Option<u64> {
    dir.file_name()?
        .to_str()?
        .strip_prefix(GENERATION_PREFIX)?
        .parse()
        .ok()
}

impl IndexRoot {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, generation: u64) -> PathBuf {
        self.root.join(generation_name(generation))
    }

    /// CURRENT 指向的 generation；指针缺失、损坏或指向未完成目录时返回 None
    pub fn current(&self) -> anyhow::Result<Option<(u64, PathBuf)>> {
        let pointer = self.root.join(CURRENT_FILE);
        if !pointer.exists() {
            return Ok(None);
        }
        let name = std::fs::read_to_string(&pointer)?;
        let dir = self.root.join(name.trim());
        let Some(generation) = generation_of(&dir) else {
            tracing::warn!("CURRENT pointer is malformed: {:?}", name.trim());
            return Ok(None);
        };
        if !Self::is_complete(&dir) {
            tracing::warn!("CURRENT points at incomplete generation {}", dir.display());
            return Ok(None);
        }
        Ok(Some((generation, dir)))
    }

    /// 分配下一代目录（不创建）
    pub fn next_generation(&self) -> anyhow::Result<(u64, PathBuf)> {
        std::fs::create_dir_all(&self.root)?;
        let mut max = 0u64;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(g) = generation_of(&entry.path()) {
                max = max.max(g);
            }
        }
        let next = max + 1;
        Ok((next, self.generation_dir(next)))
    }

    pub fn mark_complete(dir: &Path) -> anyhow::Result<()> {
        let mut f = std::fs::File::create(dir.join(COMPLETE_MARKER))?;
        f.write_all(b"ok\n")?;
        f.sync_all()?;
        Ok(())
    }

    pub fn is_complete(dir: &Path) -> bool {
        dir.join(COMPLETE_MARKER).is_file()
    }

    /// 原子切换 CURRENT 到指定 generation
    pub fn publish(&self, generation: u64) -> anyhow::Result<()> {
        let dir = self.generation_dir(generation);
        if !Self::is_complete(&dir) {
            anyhow::bail!("refusing to publish incomplete generation {}", dir.display());
        }

        let pointer = self.root.join(CURRENT_FILE);
        let tmp = self.root.join(format!("{}.tmp", CURRENT_FILE));
        {
            let mut f = std::fs::File::create(&tmp)?;
            writeln!(f, "{}", generation_name(generation))?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &pointer)?;

        if let Ok(d) = std::fs::File::open(&self.root) {
            let _ = d.sync_all();
        }
        tracing::debug!("CURRENT -> {}", generation_name(generation));
        Ok(())
    }

    pub fn remove_generation(&self, generation: u64) -> anyhow::Result<()> {
        let dir = self.generation_dir(generation);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// 删除除 `keep` 之外的所有 generation（崩溃遗留的半成品、未清理的旧代）
    pub fn sweep_stale(&self, keep: u64) -> anyhow::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            match generation_of(&path) {
                Some(g) if g != keep && path.is_dir() => {
                    std::fs::remove_dir_all(&path)?;
                    removed += 1;
                }
                _ => {}
            }
        }
        if removed > 0 {
            tracing::info!("Removed {} stale index generations", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("solitudes-{}-{}", tag, nanos))
    }

    #[test]
    fn empty_root_has_no_current() {
        let root = IndexRoot::new(unique_tmp_dir("ptr-empty"));
        assert!(root.current().unwrap().is_none());
        assert_eq!(root.next_generation().unwrap().0, 1);
    }

    #[test]
    fn publish_requires_complete_marker() {
        let root = IndexRoot::new(unique_tmp_dir("ptr-publish"));
        let (g, dir) = root.next_generation().unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        assert!(root.publish(g).is_err());
        assert!(root.current().unwrap().is_none());

        IndexRoot::mark_complete(&dir).unwrap();
        root.publish(g).unwrap();
        assert_eq!(root.current().unwrap(), Some((g, dir)));
        assert_eq!(root.next_generation().unwrap().0, g + 1);
    }

    #[test]
    fn sweep_keeps_only_live_generation() {
        let root = IndexRoot::new(unique_tmp_dir("ptr-sweep"));
        for g in 1..=3 {
            std::fs::create_dir_all(root.generation_dir(g)).unwrap();
        }
        assert_eq!(root.sweep_stale(2).unwrap(), 2);
        assert!(root.generation_dir(2).exists());
        assert!(!root.generation_dir(1).exists());
        assert!(!root.generation_dir(3).exists());
    }

    #[test]
    fn generation_name_round_trips() {
        assert_eq!(generation_of(Path::new("/x/gen-000042")), Some(42));
        assert_eq!(generation_of(Path::new("/x/other")), None);
    }
}
