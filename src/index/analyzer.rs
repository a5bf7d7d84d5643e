use std::sync::{Arc, OnceLock};

use jieba_rs::Jieba;
use serde::{Deserialize, Serialize};
use tantivy::tokenizer::{
    LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer, Token, TokenStream, Tokenizer,
};
use tantivy::Index;

/// 所有文本字段共用的 analyzer 名称
pub const ANALYZER_NAME: &str = "solitudes";

/// 分词策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segmentation {
    /// 中文分词（jieba 词典 + 可选 HMM 新词发现）
    Jieba,
    /// 空白/标点切分，适合纯西文内容
    Simple,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentMode {
    /// 长词再切出子词，召回优先
    Search,
    Default,
}

/// 类型化的 analyzer 映射。
///
/// tantivy 不持久化自定义 tokenizer，每次 create/open 都必须用同一份配置重新注册，
/// 否则查询与索引的切词会不一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub tokenizer: Segmentation,
    pub use_hmm: bool,
    pub mode: SegmentMode,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            tokenizer: Segmentation::Jieba,
            use_hmm: true,
            mode: SegmentMode::Search,
        }
    }
}

impl AnalyzerConfig {
    pub fn simple() -> Self {
        Self {
            tokenizer: Segmentation::Simple,
            ..Self::default()
        }
    }

    pub fn build(&self) -> TextAnalyzer {
        match self.tokenizer {
            Segmentation::Jieba => TextAnalyzer::builder(JiebaTokenizer::new(self.use_hmm, self.mode))
                .filter(RemoveLongFilter::limit(40))
                .filter(LowerCaser)
                .build(),
            Segmentation::Simple => TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(RemoveLongFilter::limit(40))
                .filter(LowerCaser)
                .build(),
        }
    }

    pub fn register(&self, index: &Index) {
        index.tokenizers().register(ANALYZER_NAME, self.build());
    }
}

/// 词典加载较慢（数 MB），进程内共享一份
fn shared_jieba() -> Arc<Jieba> {
    static JIEBA: OnceLock<Arc<Jieba>> = OnceLock::new();
    JIEBA.get_or_init(|| Arc::new(Jieba::new())).clone()
}

#[derive(Clone)]
pub struct JiebaTokenizer {
    jieba: Arc<Jieba>,
    use_hmm: bool,
    mode: SegmentMode,
}

impl JiebaTokenizer {
    pub fn new(use_hmm: bool, mode: SegmentMode) -> Self {
        Self {
            jieba: shared_jieba(),
            use_hmm,
            mode,
        }
    }
}

pub struct JiebaTokenStream {
    tokens: Vec<Token>,
    cursor: usize,
}

impl Tokenizer for JiebaTokenizer {
    type TokenStream<'a> = JiebaTokenStream;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> JiebaTokenStream {
        let words = match self.mode {
            SegmentMode::Search => self.jieba.cut_for_search(text, self.use_hmm),
            SegmentMode::Default => self.jieba.cut(text, self.use_hmm),
        };

        let base = text.as_ptr() as usize;
        let mut tokens = Vec::with_capacity(words.len());
        for word in words {
            if !word.chars().any(char::is_alphanumeric) {
                continue;
            }
            // jieba 返回的都是 text 的子切片，指针差即字节偏移
            let offset_from = word.as_ptr() as usize - base;
            tokens.push(Token {
                offset_from,
                offset_to: offset_from + word.len(),
                position: tokens.len(),
                text: word.to_string(),
                position_length: 1,
            });
        }
        JiebaTokenStream { tokens, cursor: 0 }
    }
}

impl TokenStream for JiebaTokenStream {
    fn advance(&mut self) -> bool {
        if self.cursor < self.tokens.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn token(&self) -> &Token {
        &self.tokens[self.cursor - 1]
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.tokens[self.cursor - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(config: AnalyzerConfig, text: &str) -> Vec<String> {
        let mut analyzer = config.build();
        let mut stream = analyzer.token_stream(text);
        let mut out = Vec::new();
        while stream.advance() {
            out.push(stream.token().text.clone());
        }
        out
    }

    #[test]
    fn jieba_segments_chinese_and_lowercases() {
        let toks = tokens(AnalyzerConfig::default(), "我们中出了一个叛徒 Rust");
        assert!(toks.contains(&"叛徒".to_string()));
        assert!(toks.contains(&"rust".to_string()));
        assert!(!toks.iter().any(|t| t.trim().is_empty()));
    }

    #[test]
    fn jieba_offsets_point_into_source() {
        let text = "南京市长江大桥";
        let mut analyzer = AnalyzerConfig::default().build();
        let mut stream = analyzer.token_stream(text);
        while stream.advance() {
            let t = stream.token();
            assert_eq!(&text[t.offset_from..t.offset_to], t.text);
        }
    }

    #[test]
    fn simple_tokenizer_splits_on_punctuation() {
        let toks = tokens(AnalyzerConfig::simple(), "Hello, World!");
        assert_eq!(toks, vec!["hello", "world"]);
    }

    #[test]
    fn config_deserializes_lowercase_names() {
        let c: AnalyzerConfig =
            toml::from_str("tokenizer = \"simple\"\nuse_hmm = false\nmode = \"default\"").unwrap();
        assert_eq!(c.tokenizer, Segmentation::Simple);
        assert!(!c.use_hmm);
        assert_eq!(c.mode, SegmentMode::Default);
    }
}
