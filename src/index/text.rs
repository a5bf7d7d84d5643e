use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::{QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, INDEXED, STORED,
    STRING,
};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use super::analyzer::{AnalyzerConfig, ANALYZER_NAME};
use super::document::{IndexableRecord, RecordKind};
use crate::storage::pointer::generation_of;

/// 单写线程即可：重建时索引是串行的
const WRITER_HEAP_BYTES: usize = 50_000_000;
const SNIPPET_CHARS: usize = 120;

#[derive(Clone, Copy)]
pub struct Fields {
    pub id: Field,
    pub kind: Field,
    pub slug: Field,
    pub title: Field,
    pub content: Field,
    pub tags: Field,
    pub version: Field,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub kind: String,
    pub slug: String,
    pub title: String,
    pub snippet: String,
    pub score: f32,
}

/// tantivy 全文索引的一代实例
///
/// - 写入经 `Mutex<Option<IndexWriter>>` 串行化，`close` 后写入报错、读取照常；
/// - reader 采用手动 reload，`commit` 之后才对查询可见。
pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    fields: Fields,
    path: PathBuf,
}

pub fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    let text = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(ANALYZER_NAME)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();

    builder.add_text_field("id", STRING | STORED);
    builder.add_text_field("kind", STRING | STORED);
    builder.add_text_field("slug", STRING | STORED);
    builder.add_text_field("title", text.clone());
    builder.add_text_field("content", text.clone());
    builder.add_text_field("tags", text);
    builder.add_u64_field("version", INDEXED | STORED);
    builder.build()
}

fn fields_from_schema(schema: &Schema) -> Result<Fields> {
    let get = |name: &str| {
        schema
            .get_field(name)
            .map_err(|_| anyhow!("schema missing {}", name))
    };
    Ok(Fields {
        id: get("id")?,
        kind: get("kind")?,
        slug: get("slug")?,
        title: get("title")?,
        content: get("content")?,
        tags: get("tags")?,
        version: get("version")?,
    })
}

impl TextIndex {
    /// 打开已有索引；目录中没有索引时返回 `Ok(None)`
    pub fn open(path: &Path, analyzer: &AnalyzerConfig) -> Result<Option<Self>> {
        if !path.join("meta.json").exists() {
            return Ok(None);
        }
        let index = Index::open_in_dir(path)?;
        Self::from_index(index, path, analyzer).map(Some)
    }

    /// 在空目录创建新索引并注册 analyzer
    pub fn create(path: &Path, analyzer: &AnalyzerConfig) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let index = Index::create_in_dir(path, build_schema())?;
        Self::from_index(index, path, analyzer)
    }

    pub fn open_or_create(path: &Path, analyzer: &AnalyzerConfig) -> Result<Self> {
        match Self::open(path, analyzer)? {
            Some(idx) => Ok(idx),
            None => Self::create(path, analyzer),
        }
    }

    fn from_index(index: Index, path: &Path, analyzer: &AnalyzerConfig) -> Result<Self> {
        analyzer.register(&index);
        let fields = fields_from_schema(&index.schema())?;
        let writer: IndexWriter = index
            .writer_with_num_threads(1, WRITER_HEAP_BYTES)
            .map_err(|e| anyhow!("create index writer: {e:?}"))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            reader,
            writer: Mutex::new(Some(writer)),
            fields,
            path: path.to_path_buf(),
        })
    }

    /// 删除整个索引目录（调用方需保证没有活跃 writer）
    pub fn remove_all(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> Option<u64> {
        generation_of(&self.path)
    }

    pub fn fields(&self) -> Fields {
        self.fields
    }

    /// 按 ID upsert；`commit` 前不可见
    pub fn index(&self, record: &IndexableRecord) -> Result<()> {
        record.validate()?;
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| anyhow!("index is closed"))?;
        let f = &self.fields;

        writer.delete_term(Term::from_field_text(f.id, &record.id));
        let mut d = doc!(
            f.id => record.id.clone(),
            f.kind => record.kind.as_str().to_string(),
            f.slug => record.slug.clone(),
            f.title => record.title.clone(),
            f.content => record.content.clone(),
            f.version => record.version as u64,
        );
        for tag in &record.tags {
            d.add_text(f.tags, tag);
        }
        writer.add_document(d)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| anyhow!("index is closed"))?;
        writer.delete_term(Term::from_field_text(self.fields.id, id));
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        {
            let mut guard = self.writer.lock();
            let writer = guard.as_mut().ok_or_else(|| anyhow!("index is closed"))?;
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    /// 释放 writer（及目录锁）；已打开的 reader 仍可查询
    pub fn close(&self) -> Result<()> {
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.wait_merging_threads()?;
            tracing::debug!("Closed index writer at {}", self.path.display());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn get(&self, id: &str) -> Result<Option<IndexableRecord>> {
        let searcher = self.reader.searcher();
        let q = TermQuery::new(
            Term::from_field_text(self.fields.id, id),
            IndexRecordOption::Basic,
        );
        let top = searcher.search(&q, &TopDocs::with_limit(1))?;
        let Some((_, addr)) = top.into_iter().next() else {
            return Ok(None);
        };
        let doc: TantivyDocument = searcher.doc(addr)?;
        Ok(Some(self.to_record(&doc)))
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let searcher = self.reader.searcher();
        let f = &self.fields;
        let parser = QueryParser::for_index(&self.index, vec![f.title, f.content, f.tags]);
        let q = parser.parse_query(query)?;

        // TopDocs 按 limit 预分配，超大 limit 会溢出
        let limit = limit.clamp(1, searcher.num_docs().max(1) as usize);
        let top = searcher.search(&q, &TopDocs::with_limit(limit))?;
        let mut hits = Vec::with_capacity(top.len());
        for (score, addr) in top {
            let doc: TantivyDocument = searcher.doc(addr)?;
            let content = text_of(&doc, f.content);
            hits.push(SearchHit {
                id: text_of(&doc, f.id),
                kind: text_of(&doc, f.kind),
                slug: text_of(&doc, f.slug),
                title: text_of(&doc, f.title),
                snippet: content.chars().take(SNIPPET_CHARS).collect(),
                score,
            });
        }
        Ok(hits)
    }

    fn to_record(&self, doc: &TantivyDocument) -> IndexableRecord {
        let f = &self.fields;
        IndexableRecord {
            id: text_of(doc, f.id),
            kind: RecordKind::parse(&text_of(doc, f.kind)).unwrap_or(RecordKind::Article),
            slug: text_of(doc, f.slug),
            title: text_of(doc, f.title),
            content: text_of(doc, f.content),
            tags: doc
                .get_all(f.tags)
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            version: doc
                .get_first(f.version)
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        }
    }
}

fn text_of(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}
