use unicode_normalization::UnicodeNormalization;

use crate::storage::{HistoricalRecord, PrimaryRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Article,
    History,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Article => "article",
            RecordKind::History => "history",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "article" => Some(RecordKind::Article),
            "history" => Some(RecordKind::History),
            _ => None,
        }
    }
}

/// 可索引投影：稳定 ID + 检索载荷，产出后不可变
///
/// ID 规则：`{id}.{version}`（主记录）/ `{parent_id}.{version}`（历史版本），
/// 同一文章的当前版本与历史版本因此天然不冲突。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexableRecord {
    pub id: String,
    pub kind: RecordKind,
    pub slug: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub version: u32,
}

impl IndexableRecord {
    /// 源记录 ID 为空时投影出的 ID 形如 `.3`，无法寻址
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() || self.id.starts_with('.') {
            anyhow::bail!("record {:?} has no source id", self.id);
        }
        Ok(())
    }
}

/// NFC 规范化：同一段文本只产生一种 term
fn nfc(s: &str) -> String {
    s.nfc().collect()
}

pub fn index_id(id: &str, version: u32) -> String {
    format!("{}.{}", id, version)
}

impl From<&PrimaryRecord> for IndexableRecord {
    fn from(r: &PrimaryRecord) -> Self {
        Self {
            id: index_id(&r.id, r.version),
            kind: RecordKind::Article,
            slug: r.slug.clone(),
            title: nfc(&r.title),
            content: nfc(&r.content),
            tags: r.tags.iter().map(|t| nfc(t)).collect(),
            version: r.version,
        }
    }
}

impl From<&HistoricalRecord> for IndexableRecord {
    fn from(r: &HistoricalRecord) -> Self {
        let (slug, title, tags) = match &r.parent {
            Some(p) => (
                p.slug.clone(),
                nfc(&p.title),
                p.tags.iter().map(|t| nfc(t)).collect(),
            ),
            None => (String::new(), String::new(), Vec::new()),
        };
        Self {
            id: index_id(&r.parent_id, r.version),
            kind: RecordKind::History,
            slug,
            title,
            content: nfc(&r.content),
            tags,
            version: r.version,
        }
    }
}
