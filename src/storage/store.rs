use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// 主记录（文章当前版本）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimaryRecord {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    /// unix 秒
    #[serde(default)]
    pub updated_at: i64,
}

/// 历史版本记录；`parent` 由 `find_all_with_parent` 预加载
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub parent_id: String,
    pub version: u32,
    pub content: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PrimaryRecord>,
}

fn default_version() -> u32 {
    1
}

/// 持久化记录源（外部协作者，仅约定契约）
///
/// 任何错误都按整体失败处理，调用方不做部分重试。
pub trait RecordStore: Send + Sync {
    fn find_all(&self) -> anyhow::Result<Vec<PrimaryRecord>>;
    fn find_all_with_parent(&self) -> anyhow::Result<Vec<HistoricalRecord>>;
}

/// 记录文件格式：`{ "articles": [...], "histories": [...] }`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecordDocument {
    #[serde(default)]
    pub articles: Vec<PrimaryRecord>,
    #[serde(default)]
    pub histories: Vec<HistoricalRecord>,
}

impl RecordDocument {
    fn histories_with_parent(&self) -> Vec<HistoricalRecord> {
        let parents: HashMap<&str, &PrimaryRecord> =
            self.articles.iter().map(|a| (a.id.as_str(), a)).collect();
        self.histories
            .iter()
            .map(|h| HistoricalRecord {
                parent: parents.get(h.parent_id.as_str()).map(|p| (*p).clone()),
                ..h.clone()
            })
            .collect()
    }
}

/// 内存实现：测试与嵌入场景
#[derive(Default)]
pub struct MemoryStore {
    doc: RwLock<RecordDocument>,
}

impl MemoryStore {
    pub fn new(articles: Vec<PrimaryRecord>, histories: Vec<HistoricalRecord>) -> Self {
        Self {
            doc: RwLock::new(RecordDocument {
                articles,
                histories,
            }),
        }
    }

    pub fn insert_article(&self, article: PrimaryRecord) {
        let mut doc = self.doc.write();
        doc.articles.retain(|a| a.id != article.id);
        doc.articles.push(article);
    }

    pub fn insert_history(&self, history: HistoricalRecord) {
        self.doc.write().histories.push(history);
    }
}

impl RecordStore for MemoryStore {
    fn find_all(&self) -> anyhow::Result<Vec<PrimaryRecord>> {
        Ok(self.doc.read().articles.clone())
    }

    fn find_all_with_parent(&self) -> anyhow::Result<Vec<HistoricalRecord>> {
        Ok(self.doc.read().histories_with_parent())
    }
}

/// JSON 文件实现：每次查询都重新读取文件，反映最新落盘内容
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> anyhow::Result<RecordDocument> {
        let file = std::fs::File::open(&self.path).map_err(|e| {
            anyhow::anyhow!("open record file {}: {}", self.path.display(), e)
        })?;
        let doc = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(doc)
    }
}

impl RecordStore for JsonStore {
    fn find_all(&self) -> anyhow::Result<Vec<PrimaryRecord>> {
        Ok(self.load()?.articles)
    }

    fn find_all_with_parent(&self) -> anyhow::Result<Vec<HistoricalRecord>> {
        Ok(self.load()?.histories_with_parent())
    }
}
