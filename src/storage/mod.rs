pub mod pointer;
pub mod store;

pub use pointer::IndexRoot;
pub use store::{
    HistoricalRecord, JsonStore, MemoryStore, PrimaryRecord, RecordDocument, RecordStore,
};
