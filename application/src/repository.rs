use crate::{ApplicationError, Clock, TableData, TableStore};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use domain::{
    CREATED_AT_COLUMN, DomainError, HOUSEKEEPING_COLUMNS, ROW_ID_COLUMN, Record, RecordInput,
    RecordKey, RowMeta, TableSchema, UPDATED_AT_COLUMN,
};
use serde::Serialize;
use serde_json::{Number, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Maps a column name to its physical offset in the store.
///
/// Captured from the first header observed and reused for the lifetime of the repository.
#[derive(Debug, Clone)]
struct ColumnBind {
    offsets: HashMap<String, usize>,
    width: usize,
}

impl ColumnBind {
    fn offset(&self, column: &str) -> Option<usize> {
        self.offsets.get(column).copied()
    }
}

#[derive(Debug, Clone)]
struct MirrorEntry {
    record: Record,
    /// Last known physical row. Cells of columns the schema does not declare are written back untouched.
    raw: Vec<Value>,
}

/// The in-memory mirror and the key index derived from it.
#[derive(Debug, Clone, Default)]
struct Mirror {
    entries: Vec<MirrorEntry>,
    index: HashMap<RecordKey, usize>,
}

impl Mirror {
    fn position(&self, key: &RecordKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn record_at(&self, key: &RecordKey) -> Option<&Record> {
        self.position(key).map(|pos| &self.entries[pos].record)
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    column_bind: Option<ColumnBind>,
    mirror: Option<Mirror>,
}

/// Records classified by an `update` call, after stamping.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub inserted: Vec<Record>,
    pub updated: Vec<Record>,
}

/// Optimistic concurrency guard for a single row.
///
/// `baseline` is the last-modified timestamp the caller's submission was based
/// on; `current` is what the store holds now. A missing baseline means the
/// caller never observed the row and is treated as stale.
pub fn ensure_not_stale(
    table: &str,
    key: &RecordKey,
    baseline: Option<DateTime<Utc>>,
    current: DateTime<Utc>,
) -> Result<(), ApplicationError> {
    match baseline {
        Some(baseline) if current <= baseline => Ok(()),
        _ => Err(ApplicationError::Conflict {
            table: table.to_string(),
            key: key.to_string(),
        }),
    }
}

struct PreparedInput {
    key: RecordKey,
    values: HashMap<String, Value>,
    baseline: Option<DateTime<Utc>>,
}

/// Key-indexed record store mirroring a row-oriented external table.
pub struct IndexedRepository {
    schema: Arc<TableSchema>,
    store: Arc<dyn TableStore>,
    clock: Arc<dyn Clock>,
    state: RwLock<RepositoryState>,
}

impl IndexedRepository {
    pub fn new(schema: Arc<TableSchema>, store: Arc<dyn TableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            schema,
            store,
            clock,
            state: RwLock::new(RepositoryState::default()),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn table(&self) -> &str {
        &self.schema.name
    }

    /// Loads the whole table from the store, replacing any in-memory state.
    pub async fn load(&self) -> Result<(), ApplicationError> {
        self.reload().await
    }

    #[instrument(skip(self), fields(table = %self.schema.name))]
    pub async fn reload(&self) -> Result<(), ApplicationError> {
        let mut state = self.state.write().await;
        let data = self.read_table().await?;

        let bind = match &state.column_bind {
            Some(bind) => bind.clone(),
            None => self.bind_columns(&data.header).await?,
        };
        let mirror = self.build_mirror(&bind, data.rows)?;
        info!(rows = mirror.entries.len(), "Table loaded into mirror");

        state.column_bind = Some(bind);
        state.mirror = Some(mirror);
        Ok(())
    }

    async fn read_table(&self) -> Result<TableData, ApplicationError> {
        self.store.flush().await?;
        self.store.read_all().await
    }

    /// Derives the column binding from the header, appending any missing housekeeping column.
    async fn bind_columns(&self, header: &[String]) -> Result<ColumnBind, ApplicationError> {
        let mut offsets = HashMap::with_capacity(header.len());
        for (offset, name) in header.iter().enumerate() {
            if offsets.insert(name.clone(), offset).is_some() {
                warn!(column = %name, "Duplicate header column, binding the last occurrence");
            }
        }

        for column in self.schema.columns() {
            if !offsets.contains_key(column) {
                return Err(ApplicationError::MissingColumn {
                    table: self.table().to_string(),
                    column: column.to_string(),
                });
            }
        }

        let mut extended = header.to_vec();
        for column in HOUSEKEEPING_COLUMNS {
            if !offsets.contains_key(column) {
                offsets.insert(column.to_string(), extended.len());
                extended.push(column.to_string());
            }
        }
        if extended.len() != header.len() {
            info!(header = ?extended, "Appending housekeeping columns to header");
            self.store.write_header(&extended).await?;
        }

        debug!(width = extended.len(), "Column binding captured");
        Ok(ColumnBind {
            offsets,
            width: extended.len(),
        })
    }

    fn build_mirror(&self, bind: &ColumnBind, rows: Vec<Vec<Value>>) -> Result<Mirror, ApplicationError> {
        let mut mirror = Mirror {
            entries: Vec::with_capacity(rows.len()),
            index: HashMap::with_capacity(rows.len()),
        };

        for (position, mut raw) in rows.into_iter().enumerate() {
            raw.resize(raw.len().max(bind.width), Value::Null);
            let record = self
                .record_from_row(bind, position, &raw)
                .map_err(|source| ApplicationError::InvalidRow {
                    table: self.table().to_string(),
                    position,
                    source,
                })?;
            let key = self.schema.key_of(record.values())?;
            if let Some(previous) = mirror.index.insert(key.clone(), position) {
                debug!(%key, previous, position, "Duplicate key in store, later row wins");
            }
            mirror.entries.push(MirrorEntry { record, raw });
        }

        Ok(mirror)
    }

    fn record_from_row(&self, bind: &ColumnBind, position: usize, raw: &[Value]) -> Result<Record, DomainError> {
        let cell = |column: &str| {
            bind.offset(column)
                .and_then(|offset| raw.get(offset))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let mut values = self.schema.create_blank();
        for column in self.schema.columns() {
            values.insert(column.to_string(), self.schema.coerce_cell(column, cell(column))?);
        }

        let meta = RowMeta {
            row_id: parse_row_id(cell(ROW_ID_COLUMN))?.unwrap_or(position as u64 + 1),
            created_at: parse_timestamp(CREATED_AT_COLUMN, cell(CREATED_AT_COLUMN))?,
            updated_at: parse_timestamp(UPDATED_AT_COLUMN, cell(UPDATED_AT_COLUMN))?,
        };
        Ok(Record::new(values, meta))
    }

    fn serialize_row(&self, bind: &ColumnBind, entry: &MirrorEntry) -> Vec<Value> {
        let mut row = entry.raw.clone();
        row.resize(row.len().max(bind.width), Value::Null);

        let mut put = |column: &str, value: Value| {
            if let Some(offset) = bind.offset(column) {
                row[offset] = value;
            }
        };
        for (column, value) in entry.record.values() {
            put(column, value.clone());
        }
        let meta = entry.record.meta();
        put(ROW_ID_COLUMN, Value::Number(Number::from(meta.row_id)));
        put(CREATED_AT_COLUMN, Value::String(format_timestamp(meta.created_at)));
        put(UPDATED_AT_COLUMN, Value::String(format_timestamp(meta.updated_at)));
        row
    }

    /// Returns the record stored under the key projected from `key`.
    pub async fn find(&self, key: &HashMap<String, Value>) -> Result<Record, ApplicationError> {
        let key = self.schema.key_of(key)?;
        let state = self.state.read().await;
        let mirror = self.loaded(&state)?;
        mirror
            .record_at(&key)
            .cloned()
            .ok_or_else(|| ApplicationError::NotFound {
                table: self.table().to_string(),
                key: key.to_string(),
            })
    }

    /// Looks up every key in order. A missing key yields `None` in its slot.
    pub async fn find_all(
        &self,
        keys: &[HashMap<String, Value>],
    ) -> Result<Vec<Option<Record>>, ApplicationError> {
        let keys = keys
            .iter()
            .map(|key| self.schema.key_of(key))
            .collect::<Result<Vec<_>, _>>()?;
        let state = self.state.read().await;
        let mirror = self.loaded(&state)?;
        Ok(keys
            .iter()
            .map(|key| mirror.record_at(key).cloned())
            .collect())
    }

    /// Copies of every record in physical row order.
    pub async fn records(&self) -> Result<Vec<Record>, ApplicationError> {
        let state = self.state.read().await;
        let mirror = self.loaded(&state)?;
        Ok(mirror.entries.iter().map(|e| e.record.clone()).collect())
    }

    pub async fn len(&self) -> Result<usize, ApplicationError> {
        let state = self.state.read().await;
        Ok(self.loaded(&state)?.entries.len())
    }

    fn loaded<'a>(&self, state: &'a RepositoryState) -> Result<&'a Mirror, ApplicationError> {
        state
            .mirror
            .as_ref()
            .ok_or_else(|| ApplicationError::NotLoaded(self.table().to_string()))
    }

    /// Inserts records with unseen keys and replaces records with known keys.
    ///
    /// The batch is applied against a fresh read of the store and is
    /// all-or-nothing: on a conflict, a schema violation or a duplicate key
    /// nothing is written and the in-memory state is left as it was.
    #[instrument(skip(self, inputs), fields(table = %self.schema.name, batch_size = inputs.len()))]
    pub async fn update(&self, inputs: Vec<RecordInput>) -> Result<UpdateOutcome, ApplicationError> {
        if inputs.is_empty() {
            debug!("Empty update batch, nothing to do");
            return Ok(UpdateOutcome::default());
        }
        let prepared = self.prepare(inputs)?;

        let mut state = self.state.write().await;
        let bind = state
            .column_bind
            .clone()
            .ok_or_else(|| ApplicationError::NotLoaded(self.table().to_string()))?;
        let previous = self.loaded(&state)?;

        let data = self.read_table().await?;
        let mut candidate = self.build_mirror(&bind, data.rows)?;

        let (to_update, to_insert): (Vec<_>, Vec<_>) = prepared
            .into_iter()
            .partition(|input| candidate.index.contains_key(&input.key));

        for input in &to_update {
            let baseline = input
                .baseline
                .or_else(|| previous.record_at(&input.key).map(|r| r.meta().updated_at));
            let current = candidate
                .record_at(&input.key)
                .map(|r| r.meta().updated_at)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            if let Err(err) = ensure_not_stale(self.table(), &input.key, baseline, current) {
                warn!(key = %input.key, ?baseline, %current, "Rejecting stale update batch");
                return Err(err);
            }
        }
        if let Some(primary) = self.schema.primary_column() {
            if to_insert.iter().any(|input| !input.values[primary].is_null()) {
                return Err(DomainError::GeneratedColumn(primary.to_string()).into());
            }
        }

        let mut touched = Vec::with_capacity(to_update.len() + to_insert.len());
        let mut outcome = UpdateOutcome::default();

        for input in to_update {
            let Some(position) = candidate.position(&input.key) else {
                continue;
            };
            let entry = &mut candidate.entries[position];
            let prior = *entry.record.meta();
            let mut values = input.values;
            if let Some(primary) = self.schema.primary_column() {
                if let Some(existing) = entry.record.get(primary) {
                    values.insert(primary.to_string(), existing.clone());
                }
            }
            let meta = RowMeta {
                updated_at: self.stamp(Some(prior.updated_at)),
                ..prior
            };
            entry.record = Record::new(values, meta);
            outcome.updated.push(entry.record.clone());
            touched.push(position);
        }

        for input in to_insert {
            let position = candidate.entries.len();
            let row_id = position as u64 + 1;
            let mut values = input.values;
            if let Some(primary) = self.schema.primary_column() {
                values.insert(primary.to_string(), Value::Number(Number::from(row_id)));
            }
            let now = self.stamp(None);
            let record = Record::new(
                values,
                RowMeta {
                    row_id,
                    created_at: now,
                    updated_at: now,
                },
            );
            outcome.inserted.push(record.clone());
            candidate.entries.push(MirrorEntry {
                record,
                raw: vec![Value::Null; bind.width],
            });
            candidate.index.insert(input.key, position);
            touched.push(position);
        }

        if let (Some(&min), Some(&max)) = (touched.iter().min(), touched.iter().max()) {
            let rows: Vec<Vec<Value>> = candidate.entries[min..=max]
                .iter()
                .map(|entry| self.serialize_row(&bind, entry))
                .collect();
            debug!(start = min, len = rows.len(), "Writing row span back to store");
            self.store.write_range(min, &rows).await?;
        }

        info!(
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            "Update batch applied"
        );
        state.mirror = Some(candidate);
        Ok(outcome)
    }

    /// Validates every input against the schema and rejects duplicate keys within the batch.
    fn prepare(&self, inputs: Vec<RecordInput>) -> Result<Vec<PreparedInput>, ApplicationError> {
        let mut seen = HashSet::with_capacity(inputs.len());
        let mut prepared = Vec::with_capacity(inputs.len());
        for input in inputs {
            let values = self.schema.create_from_values(input.values)?;
            let key = self.schema.key_of(&values)?;
            if !seen.insert(key.clone()) {
                return Err(ApplicationError::DuplicateKey {
                    table: self.table().to_string(),
                    key: key.to_string(),
                });
            }
            prepared.push(PreparedInput {
                key,
                values,
                baseline: input.baseline,
            });
        }
        Ok(prepared)
    }

    /// Current time at store precision, strictly after `previous` when given.
    fn stamp(&self, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = self.clock.now();
        let now = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        match previous {
            Some(previous) if now <= previous => previous + Duration::milliseconds(1),
            _ => now,
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(column: &str, cell: Value) -> Result<DateTime<Utc>, DomainError> {
    let invalid = |reason: String| DomainError::InvalidFieldValue {
        field: column.to_string(),
        reason,
    };
    match cell {
        Value::Null => Ok(DateTime::<Utc>::UNIX_EPOCH),
        Value::String(s) if s.trim().is_empty() => Ok(DateTime::<Utc>::UNIX_EPOCH),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| invalid(format!("Invalid timestamp {:?}: {}", s, e))),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| invalid(format!("Invalid epoch milliseconds {}", n))),
        other => Err(invalid(format!("Expected a timestamp, got {:?}", other))),
    }
}

fn parse_row_id(cell: Value) -> Result<Option<u64>, DomainError> {
    let invalid = |reason: String| DomainError::InvalidFieldValue {
        field: ROW_ID_COLUMN.to_string(),
        reason,
    };
    match cell {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| invalid(format!("Invalid row id {:?}: {}", s, e))),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| invalid(format!("Invalid row id {}", n))),
        other => Err(invalid(format!("Expected a row id, got {:?}", other))),
    }
}
