// Module declarations
pub mod persistence;

// Re-export all implementations
pub use persistence::{InMemoryTable, InMemoryWorkbook, JsonFileStoreProvider, JsonFileTableStore};
