pub mod analyzer;
pub mod document;
pub mod handle;
pub mod rebuild;
pub mod text;

pub use analyzer::{AnalyzerConfig, SegmentMode, Segmentation};
pub use document::{IndexableRecord, RecordKind};
pub use handle::IndexHandle;
pub use rebuild::{RebuildError, Rebuilder, RecordFailurePolicy};
pub use text::{SearchHit, TextIndex};
