use application::{ApplicationError, StoreProvider, TableData, TableStore};
use async_trait::async_trait;
use dashmap::DashMap;
use domain::TableSchema;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A set of named in-memory tables, shaped like sheets of a spreadsheet.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkbook {
    // Table Name -> Header + Rows
    tables: Arc<DashMap<String, TableData>>,
}

impl InMemoryWorkbook {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(DashMap::new()),
        }
    }

    /// Creates the table with `header` unless it already exists.
    pub fn create_table(&self, name: &str, header: Vec<String>) {
        self.tables.entry(name.to_string()).or_insert_with(|| {
            info!(table = %name, "Creating in-memory table");
            TableData {
                header,
                rows: Vec::new(),
            }
        });
    }

    /// Returns a handle to a table. Every handle to the same name shares the same rows.
    pub fn table(&self, name: &str) -> InMemoryTable {
        InMemoryTable {
            name: name.to_string(),
            tables: self.tables.clone(),
        }
    }

    /// Copy of a table's current contents.
    pub fn snapshot(&self, name: &str) -> Option<TableData> {
        self.tables.get(name).map(|table| table.value().clone())
    }
}

#[async_trait]
impl StoreProvider for InMemoryWorkbook {
    #[instrument(skip(self, schema), fields(table = %schema.name))]
    async fn open(&self, schema: &TableSchema) -> Result<Arc<dyn TableStore>, ApplicationError> {
        self.create_table(&schema.name, schema.physical_header());
        Ok(Arc::new(self.table(&schema.name)))
    }
}

/// Handle to one table of an `InMemoryWorkbook`.
#[derive(Debug, Clone)]
pub struct InMemoryTable {
    name: String,
    tables: Arc<DashMap<String, TableData>>,
}

impl InMemoryTable {
    fn missing(&self) -> ApplicationError {
        ApplicationError::store_failure(&self.name, format!("table '{}' does not exist", self.name))
    }
}

#[async_trait]
impl TableStore for InMemoryTable {
    async fn flush(&self) -> Result<(), ApplicationError> {
        // Writes land in the shared map immediately.
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.name))]
    async fn read_all(&self) -> Result<TableData, ApplicationError> {
        let table = self.tables.get(&self.name).ok_or_else(|| self.missing())?;
        debug!(rows = table.rows.len(), "Reading in-memory table");
        Ok(table.value().clone())
    }

    #[instrument(skip(self, header), fields(table = %self.name))]
    async fn write_header(&self, header: &[String]) -> Result<(), ApplicationError> {
        let mut table = self.tables.get_mut(&self.name).ok_or_else(|| self.missing())?;
        table.header = header.to_vec();
        Ok(())
    }

    #[instrument(skip(self, rows), fields(table = %self.name, count = rows.len()))]
    async fn write_range(&self, start: usize, rows: &[Vec<Value>]) -> Result<(), ApplicationError> {
        let mut table = self.tables.get_mut(&self.name).ok_or_else(|| self.missing())?;
        overwrite_rows(&mut table, start, rows);
        debug!(start, "Range written to in-memory table");
        Ok(())
    }
}

/// Overwrites rows starting at `start`, padding gaps and short rows with `null` up to the header width.
pub(crate) fn overwrite_rows(table: &mut TableData, start: usize, rows: &[Vec<Value>]) {
    let width = table.header.len();
    let end = start + rows.len();
    if table.rows.len() < end {
        table.rows.resize_with(end, || vec![Value::Null; width]);
    }
    for (offset, row) in rows.iter().enumerate() {
        let mut row = row.clone();
        if row.len() < width {
            row.resize(width, Value::Null);
        }
        table.rows[start + offset] = row;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::{IndexedRepository, SystemClock};
    use domain::{FieldDefinition, FieldType, RecordInput};
    use serde_json::json;
    use std::collections::HashMap;

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new(
                "users",
                vec![
                    FieldDefinition {
                        name: "name".to_string(),
                        field_type: FieldType::Text,
                    },
                    FieldDefinition {
                        name: "email".to_string(),
                        field_type: FieldType::Text,
                    },
                ],
                vec!["name".to_string()],
            )
            .build()
            .unwrap(),
        )
    }

    fn user(name: &str, email: &str) -> RecordInput {
        RecordInput::new(HashMap::from([
            ("name".to_string(), json!(name)),
            ("email".to_string(), json!(email)),
        ]))
    }

    fn key(name: &str) -> HashMap<String, Value> {
        HashMap::from([("name".to_string(), json!(name))])
    }

    async fn open_repository(workbook: &InMemoryWorkbook) -> IndexedRepository {
        let store = workbook.open(&schema()).await.unwrap();
        let repo = IndexedRepository::new(schema(), store, Arc::new(SystemClock));
        repo.load().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn write_range_extends_and_pads() {
        let workbook = InMemoryWorkbook::new();
        workbook.create_table("t", vec!["a".into(), "b".into()]);
        let table = workbook.table("t");

        table.write_range(1, &[vec![json!(1)]]).await.unwrap();
        let data = table.read_all().await.unwrap();
        assert_eq!(data.rows, vec![vec![Value::Null, Value::Null], vec![json!(1), Value::Null]]);

        table.write_range(0, &[vec![json!("x"), json!("y")]]).await.unwrap();
        assert_eq!(workbook.snapshot("t").unwrap().rows[0], vec![json!("x"), json!("y")]);
    }

    #[tokio::test]
    async fn missing_table_is_a_store_failure() {
        let workbook = InMemoryWorkbook::new();
        let result = workbook.table("nope").read_all().await;
        assert!(matches!(result, Err(ApplicationError::StoreFailure { table, .. }) if table == "nope"));
    }

    #[tokio::test]
    async fn open_creates_table_with_physical_header() {
        let workbook = InMemoryWorkbook::new();
        open_repository(&workbook).await;
        assert_eq!(
            workbook.snapshot("users").unwrap().header,
            vec!["name", "email", "rowId", "createdAt", "updatedAt"]
        );
    }

    #[tokio::test]
    async fn empty_table_insert_then_find() {
        let workbook = InMemoryWorkbook::new();
        let repo = open_repository(&workbook).await;

        let outcome = repo.update(vec![user("a", "a@example.com")]).await.unwrap();
        assert_eq!(outcome.inserted[0].meta().row_id, 1);
        assert_eq!(repo.len().await.unwrap(), 1);
        assert_eq!(repo.find(&key("a")).await.unwrap(), outcome.inserted[0]);

        let stored = workbook.snapshot("users").unwrap();
        assert_eq!(stored.rows.len(), 1);
        assert_eq!(stored.rows[0][0], json!("a"));
        assert_eq!(stored.rows[0][2], json!(1));
    }

    #[tokio::test]
    async fn second_writer_causes_conflict() {
        let workbook = InMemoryWorkbook::new();
        let ours = open_repository(&workbook).await;
        ours.update(vec![user("a", "t1@example.com")]).await.unwrap();

        let theirs = open_repository(&workbook).await;
        let mine = ours.find(&key("a")).await.unwrap();
        let their_copy = theirs.find(&key("a")).await.unwrap();
        let newer = theirs
            .update(vec![their_copy.to_input().set("email", json!("t2@example.com"))])
            .await
            .unwrap();
        assert!(newer.updated[0].meta().updated_at > mine.meta().updated_at);

        let result = ours
            .update(vec![mine.to_input().set("email", json!("stale@example.com"))])
            .await;
        assert!(matches!(result, Err(ApplicationError::Conflict { .. })));
        assert_eq!(workbook.snapshot("users").unwrap().rows[0][1], json!("t2@example.com"));

        ours.reload().await.unwrap();
        let refreshed = ours.find(&key("a")).await.unwrap();
        assert_eq!(refreshed.get("email"), Some(&json!("t2@example.com")));
    }

    #[tokio::test]
    async fn concurrent_inserts_from_two_repositories_do_not_collide() {
        let workbook = InMemoryWorkbook::new();
        let first = open_repository(&workbook).await;
        let second = open_repository(&workbook).await;

        first.update(vec![user("a", "a@example.com")]).await.unwrap();
        let outcome = second.update(vec![user("b", "b@example.com")]).await.unwrap();
        assert_eq!(outcome.inserted[0].meta().row_id, 2);
        assert_eq!(workbook.snapshot("users").unwrap().rows.len(), 2);
    }
}
