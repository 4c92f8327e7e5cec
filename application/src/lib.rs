use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{DomainError, Record, RecordInput, TableSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::{MemoryRefreshKind, Pid, System};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

mod repository;

pub use repository::{IndexedRepository, UpdateOutcome, ensure_not_stale};

// --- Application Errors ---
#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),
    #[error("Table '{0}' has not been loaded")]
    NotLoaded(String),
    #[error("No record with key {key} in table '{table}'")]
    NotFound { table: String, key: String },
    #[error("Record {key} in table '{table}' was modified since it was read")]
    Conflict { table: String, key: String },
    #[error("Key {key} appears more than once in the update batch for table '{table}'")]
    DuplicateKey { table: String, key: String },
    #[error("Column '{column}' is missing from the header of table '{table}'")]
    MissingColumn { table: String, column: String },
    #[error("Row {position} of table '{table}' cannot be read: {source}")]
    InvalidRow {
        table: String,
        position: usize,
        source: DomainError,
    },
    #[error("Store operation failed for table '{table}': {source}")]
    StoreFailure {
        table: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Infrastructure error: {0}")]
    InfrastructureError(String),
    #[error("Schema violation: {0}")]
    SchemaViolation(#[from] DomainError),
}

impl ApplicationError {
    pub fn store_failure(
        table: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ApplicationError::StoreFailure {
            table: table.to_string(),
            source: source.into(),
        }
    }
}

// --- Infrastructure Interfaces (Traits) ---

/// Raw contents of a table: the header row and the data rows below it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TableData {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// A row/column store that can only read everything and overwrite ranges.
///
/// Row positions passed to `write_range` are zero-based data-row offsets; the header is not counted.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Makes every previous write visible to the next `read_all`.
    async fn flush(&self) -> Result<(), ApplicationError>;
    /// Reads the header and all data rows.
    async fn read_all(&self) -> Result<TableData, ApplicationError>;
    /// Replaces the header row.
    async fn write_header(&self, header: &[String]) -> Result<(), ApplicationError>;
    /// Overwrites `rows.len()` consecutive data rows starting at `start`, extending the table if needed.
    async fn write_range(&self, start: usize, rows: &[Vec<Value>]) -> Result<(), ApplicationError>;
}

/// Opens the backing store for a table, creating an empty one when it does not exist yet.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open(&self, schema: &TableSchema) -> Result<Arc<dyn TableStore>, ApplicationError>;
}

/// Source of creation and modification timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// --- Request/Response Models (Data Transfer Objects - DTOs) ---

#[derive(Serialize, Debug)]
pub struct TableResponse {
    pub name: String,
}

#[derive(Serialize, Debug)]
pub struct ListTablesResponse {
    pub tables: Vec<TableResponse>,
}

/// Key lookup. Only the key columns of `key` are read, so a full record body works too.
#[derive(Deserialize, Debug)]
pub struct FindRequest {
    pub key: HashMap<String, Value>,
}

#[derive(Deserialize, Debug)]
pub struct FindAllRequest {
    pub keys: Vec<HashMap<String, Value>>,
}

/// Body of an update: one record or a batch. A single record is a batch of one.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum UpdateBatch {
    // Listed first: a JSON array would otherwise also match the struct's sequence form.
    Many(Vec<RecordInput>),
    One(RecordInput),
}

impl From<UpdateBatch> for Vec<RecordInput> {
    fn from(batch: UpdateBatch) -> Self {
        match batch {
            UpdateBatch::Many(inputs) => inputs,
            UpdateBatch::One(input) => vec![input],
        }
    }
}

#[derive(Serialize, Debug)]
pub struct FindAllResponse {
    /// One slot per requested key, `null` where the key is unknown.
    pub records: Vec<Option<Record>>,
    pub found: usize,
}

#[derive(Serialize, Debug)]
pub struct RecordsResponse {
    pub records: Vec<Record>,
    pub total: usize,
}

#[derive(Serialize, Debug)]
pub struct MemoryStats {
    total_bytes: u64,
    used_bytes: u64,
    available_bytes: u64,
    process_used_bytes: u64,
}

#[derive(Serialize, Debug)]
pub struct RepositoryStats {
    total_tables: usize,
    total_records: usize,
}

/// Response for the /stats endpoint.
#[derive(Serialize, Debug)]
pub struct StatsResponse {
    memory: MemoryStats,
    repository: RepositoryStats,
}

// --- Application Services (Use Cases) ---

/// Registry of loaded tables, each served by its own `IndexedRepository`.
pub struct TableService {
    provider: Arc<dyn StoreProvider>,
    clock: Arc<dyn Clock>,
    tables: RwLock<HashMap<String, Arc<IndexedRepository>>>,
}

impl TableService {
    pub fn new(provider: Arc<dyn StoreProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            clock,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Validates the schema, opens its store and loads it.
    #[instrument(skip(self, schema_def), fields(table = %schema_def.name))]
    pub async fn create_table(&self, schema_def: TableSchema) -> Result<TableSchema, ApplicationError> {
        info!("Attempting to create table");
        let schema = schema_def.build()?;
        if self.tables.read().await.contains_key(&schema.name) {
            warn!("Table creation failed: table already exists");
            return Err(ApplicationError::TableAlreadyExists(schema.name));
        }

        // The registry lock is not held across store I/O.
        let store = self.provider.open(&schema).await.map_err(|e| {
            error!("Failed to open store for table: {}", e);
            e
        })?;
        let repository = Arc::new(IndexedRepository::new(
            Arc::new(schema.clone()),
            store,
            self.clock.clone(),
        ));
        repository.load().await?;

        let mut tables = self.tables.write().await;
        if tables.contains_key(&schema.name) {
            warn!("Table was created concurrently, discarding this load");
            return Err(ApplicationError::TableAlreadyExists(schema.name));
        }
        tables.insert(schema.name.clone(), repository);
        info!("Table created and loaded");
        Ok(schema)
    }

    #[instrument(skip(self))]
    pub async fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn repository(&self, name: &str) -> Result<Arc<IndexedRepository>, ApplicationError> {
        self.tables.read().await.get(name).cloned().ok_or_else(|| {
            warn!(table = %name, "Table not found");
            ApplicationError::TableNotFound(name.to_string())
        })
    }

    pub async fn get_schema(&self, name: &str) -> Result<TableSchema, ApplicationError> {
        Ok(self.repository(name).await?.schema().clone())
    }

    #[instrument(skip(self, key))]
    pub async fn find(&self, name: &str, key: &HashMap<String, Value>) -> Result<Record, ApplicationError> {
        self.repository(name).await?.find(key).await
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    pub async fn find_all(
        &self,
        name: &str,
        keys: &[HashMap<String, Value>],
    ) -> Result<FindAllResponse, ApplicationError> {
        let records = self.repository(name).await?.find_all(keys).await?;
        let found = records.iter().filter(|r| r.is_some()).count();
        debug!(found, "Batch lookup finished");
        Ok(FindAllResponse { records, found })
    }

    #[instrument(skip(self, inputs), fields(batch_size = inputs.len()))]
    pub async fn update(&self, name: &str, inputs: Vec<RecordInput>) -> Result<UpdateOutcome, ApplicationError> {
        let repository = self.repository(name).await?;
        repository.update(inputs).await.map_err(|e| {
            match &e {
                ApplicationError::Conflict { .. } => warn!("Update rejected: {}", e),
                _ => error!("Update failed: {}", e),
            }
            e
        })
    }

    #[instrument(skip(self))]
    pub async fn reload(&self, name: &str) -> Result<usize, ApplicationError> {
        let repository = self.repository(name).await?;
        repository.reload().await?;
        repository.len().await
    }

    pub async fn records(&self, name: &str) -> Result<RecordsResponse, ApplicationError> {
        let records = self.repository(name).await?.records().await?;
        Ok(RecordsResponse {
            total: records.len(),
            records,
        })
    }

    /// Number of tables and the total number of mirrored records.
    pub async fn totals(&self) -> Result<(usize, usize), ApplicationError> {
        let tables = self.tables.read().await;
        let mut total_records = 0;
        for repository in tables.values() {
            total_records += repository.len().await?;
        }
        Ok((tables.len(), total_records))
    }
}

pub struct StatsService {
    tables: Arc<TableService>,
}

impl StatsService {
    pub fn new(tables: Arc<TableService>) -> Self {
        Self { tables }
    }

    #[instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<StatsResponse, ApplicationError> {
        info!("Gathering repository and memory statistics");
        let (total_tables, total_records) = self.tables.totals().await?;

        let memory = tokio::task::spawn_blocking(|| {
            let mut sys = System::new_all();
            sys.refresh_memory_specifics(MemoryRefreshKind::everything());
            let current_pid = Pid::from(std::process::id() as usize);
            MemoryStats {
                total_bytes: sys.total_memory(),
                used_bytes: sys.used_memory(),
                available_bytes: sys.available_memory(),
                process_used_bytes: sys.process(current_pid).map_or(0, |p| p.memory()),
            }
        })
        .await
        .map_err(|e| {
            ApplicationError::InfrastructureError(format!("System stat gathering task failed: {}", e))
        })?;
        debug!(?memory, "Memory stats gathered");

        Ok(StatsResponse {
            memory,
            repository: RepositoryStats {
                total_tables,
                total_records,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{FieldDefinition, FieldType};
    use serde_json::json;
    use std::sync::Mutex;

    /// Provider handing out empty tables, one per name.
    #[derive(Default)]
    struct EmptyTables {
        opened: Mutex<Vec<String>>,
    }

    struct EmptyTable(Mutex<TableData>);

    #[async_trait]
    impl TableStore for EmptyTable {
        async fn flush(&self) -> Result<(), ApplicationError> {
            Ok(())
        }
        async fn read_all(&self) -> Result<TableData, ApplicationError> {
            Ok(self.0.lock().unwrap().clone())
        }
        async fn write_header(&self, header: &[String]) -> Result<(), ApplicationError> {
            self.0.lock().unwrap().header = header.to_vec();
            Ok(())
        }
        async fn write_range(&self, start: usize, rows: &[Vec<Value>]) -> Result<(), ApplicationError> {
            let mut data = self.0.lock().unwrap();
            let end = (start + rows.len()).min(data.rows.len());
            data.rows.splice(start..end, rows.iter().cloned());
            Ok(())
        }
    }

    #[async_trait]
    impl StoreProvider for EmptyTables {
        async fn open(&self, schema: &TableSchema) -> Result<Arc<dyn TableStore>, ApplicationError> {
            self.opened.lock().unwrap().push(schema.name.clone());
            Ok(Arc::new(EmptyTable(Mutex::new(TableData {
                header: schema.physical_header(),
                rows: Vec::new(),
            }))))
        }
    }

    /// Provider that parks `open` for one table name until released.
    struct GatedTables {
        inner: EmptyTables,
        gated: &'static str,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl StoreProvider for GatedTables {
        async fn open(&self, schema: &TableSchema) -> Result<Arc<dyn TableStore>, ApplicationError> {
            if schema.name == self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.open(schema).await
        }
    }

    fn tags_schema() -> TableSchema {
        TableSchema::new(
            "tags",
            vec![FieldDefinition {
                name: "label".to_string(),
                field_type: FieldType::Text,
            }],
            vec!["label".to_string()],
        )
    }

    fn label(l: &str) -> HashMap<String, Value> {
        HashMap::from([("label".to_string(), json!(l))])
    }

    #[tokio::test]
    async fn create_table_registers_and_loads() {
        let provider = Arc::new(EmptyTables::default());
        let service = TableService::new(provider.clone(), Arc::new(SystemClock));

        service.create_table(tags_schema()).await.unwrap();
        assert_eq!(service.list_tables().await, vec!["tags"]);
        assert_eq!(service.get_schema("tags").await.unwrap().key_columns, vec!["label"]);
        assert_eq!(*provider.opened.lock().unwrap(), vec!["tags"]);

        let again = service.create_table(tags_schema()).await;
        assert!(matches!(again, Err(ApplicationError::TableAlreadyExists(_))));
    }

    #[tokio::test]
    async fn create_table_rejects_invalid_schema() {
        let service = TableService::new(Arc::new(EmptyTables::default()), Arc::new(SystemClock));
        let mut schema = tags_schema();
        schema.key_columns = vec!["missing".to_string()];
        let result = service.create_table(schema).await;
        assert!(matches!(result, Err(ApplicationError::SchemaViolation(DomainError::InvalidSchema(_)))));
        assert!(service.list_tables().await.is_empty());
    }

    #[tokio::test]
    async fn service_routes_operations_to_table() {
        let service = TableService::new(Arc::new(EmptyTables::default()), Arc::new(SystemClock));
        service.create_table(tags_schema()).await.unwrap();

        let outcome = service
            .update("tags", vec![RecordInput::new(label("rust")), RecordInput::new(label("db"))])
            .await
            .unwrap();
        assert_eq!(outcome.inserted.len(), 2);

        let found = service.find("tags", &label("db")).await.unwrap();
        assert_eq!(found.meta().row_id, 2);

        let batch = service
            .find_all("tags", &[label("rust"), label("none")])
            .await
            .unwrap();
        assert_eq!(batch.found, 1);
        assert!(batch.records[1].is_none());

        assert_eq!(service.reload("tags").await.unwrap(), 2);
        assert_eq!(service.records("tags").await.unwrap().total, 2);
        assert_eq!(service.totals().await.unwrap(), (1, 2));
    }

    #[tokio::test]
    async fn registry_is_not_locked_while_a_table_loads() {
        let provider = Arc::new(GatedTables {
            inner: EmptyTables::default(),
            gated: "slow",
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let service = Arc::new(TableService::new(provider.clone(), Arc::new(SystemClock)));
        service.create_table(tags_schema()).await.unwrap();

        let mut slow = tags_schema();
        slow.name = "slow".to_string();
        let creating = tokio::spawn({
            let service = service.clone();
            async move { service.create_table(slow).await }
        });

        provider.entered.notified().await;
        assert!(service.tables.try_write().is_ok());
        assert!(service.find("tags", &label("none")).await.is_err());

        provider.release.notify_one();
        creating.await.unwrap().unwrap();
        assert_eq!(service.list_tables().await, vec!["slow", "tags"]);
    }

    #[test]
    fn update_body_accepts_one_record_or_many() {
        let one: Vec<RecordInput> = serde_json::from_value::<UpdateBatch>(json!({
            "values": { "label": "rust" }
        }))
        .unwrap()
        .into();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].values["label"], json!("rust"));
        assert_eq!(one[0].baseline, None);

        let many: Vec<RecordInput> = serde_json::from_value::<UpdateBatch>(json!([
            { "values": { "label": "rust" } },
            { "values": { "label": "db" }, "baseline": "2024-01-01T00:00:00.000Z" }
        ]))
        .unwrap()
        .into();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].values["label"], json!("db"));
        assert!(many[1].baseline.is_some());

        let single_element: Vec<RecordInput> =
            serde_json::from_value::<UpdateBatch>(json!([{ "values": { "label": "x" } }]))
                .unwrap()
                .into();
        assert_eq!(single_element[0].values["label"], json!("x"));
    }

    #[tokio::test]
    async fn unknown_table_is_reported() {
        let service = TableService::new(Arc::new(EmptyTables::default()), Arc::new(SystemClock));
        let result = service.find("ghost", &label("x")).await;
        assert!(matches!(result, Err(ApplicationError::TableNotFound(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn stats_count_tables_and_records() {
        let tables = Arc::new(TableService::new(Arc::new(EmptyTables::default()), Arc::new(SystemClock)));
        tables.create_table(tags_schema()).await.unwrap();
        tables.update("tags", vec![RecordInput::new(label("a"))]).await.unwrap();

        let stats = StatsService::new(tables).get_stats().await.unwrap();
        assert_eq!(stats.repository.total_tables, 1);
        assert_eq!(stats.repository.total_records, 1);
    }
}
