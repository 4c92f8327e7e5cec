use super::in_memory_table_store::overwrite_rows;
use application::{ApplicationError, StoreProvider, TableData, TableStore};
use async_trait::async_trait;
use domain::TableSchema;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Opens one JSON file per table under a data directory.
#[derive(Debug, Clone)]
pub struct JsonFileStoreProvider {
    data_dir: PathBuf,
}

impl JsonFileStoreProvider {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl StoreProvider for JsonFileStoreProvider {
    #[instrument(skip(self, schema), fields(table = %schema.name))]
    async fn open(&self, schema: &TableSchema) -> Result<Arc<dyn TableStore>, ApplicationError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| ApplicationError::store_failure(&schema.name, e))?;
        let path = self.data_dir.join(format!("{}.json", schema.name));
        let store = JsonFileTableStore::new(&schema.name, path);
        store.create_if_missing(schema.physical_header()).await?;
        Ok(Arc::new(store))
    }
}

/// A table persisted as a single `{ "header": [...], "rows": [[...], ...] }` document.
///
/// Every write rewrites the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileTableStore {
    name: String,
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonFileTableStore {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn create_if_missing(&self, header: Vec<String>) -> Result<(), ApplicationError> {
        let _guard = self.lock.lock().await;
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| ApplicationError::store_failure(&self.name, e))?;
        if !exists {
            info!(path = %self.path.display(), "Creating table file");
            self.persist(&TableData {
                header,
                rows: Vec::new(),
            })
            .await?;
        }
        Ok(())
    }

    async fn load(&self) -> Result<TableData, ApplicationError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ApplicationError::store_failure(&self.name, e))?;
        serde_json::from_slice(&bytes).map_err(|e| ApplicationError::store_failure(&self.name, e))
    }

    async fn persist(&self, data: &TableData) -> Result<(), ApplicationError> {
        let bytes = serde_json::to_vec_pretty(data)
            .map_err(|e| ApplicationError::store_failure(&self.name, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| ApplicationError::store_failure(&self.name, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ApplicationError::store_failure(&self.name, e))
    }
}

#[async_trait]
impl TableStore for JsonFileTableStore {
    async fn flush(&self) -> Result<(), ApplicationError> {
        // Each write is complete on disk before it returns.
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.name))]
    async fn read_all(&self) -> Result<TableData, ApplicationError> {
        let _guard = self.lock.lock().await;
        let data = self.load().await?;
        debug!(rows = data.rows.len(), "Read table file");
        Ok(data)
    }

    #[instrument(skip(self, header), fields(table = %self.name))]
    async fn write_header(&self, header: &[String]) -> Result<(), ApplicationError> {
        let _guard = self.lock.lock().await;
        let mut data = self.load().await?;
        data.header = header.to_vec();
        self.persist(&data).await
    }

    #[instrument(skip(self, rows), fields(table = %self.name, count = rows.len()))]
    async fn write_range(&self, start: usize, rows: &[Vec<Value>]) -> Result<(), ApplicationError> {
        let _guard = self.lock.lock().await;
        let mut data = self.load().await?;
        overwrite_rows(&mut data, start, rows);
        self.persist(&data).await?;
        debug!(start, "Range written to table file");
        Ok(())
    }
}
