pub mod in_memory_table_store;
pub mod json_file_table_store;

// Re-export both store types
pub use in_memory_table_store::{InMemoryTable, InMemoryWorkbook};
pub use json_file_table_store::{JsonFileStoreProvider, JsonFileTableStore};
