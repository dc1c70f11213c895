//! In-memory reference backend.
//!
//! [`MemoryStore`] implements the full [`SyncStore`] contract over plain
//! maps: business rows, a per-row tracking version and an append-only change
//! log. It is used by the engine's own tests and is a template for real
//! backends. Transactions work on a private copy of the state and publish it
//! on commit, so an uncommitted transaction leaves no trace.

use crate::{
    error::Result, ChangeEntry, ChangeOperation, ChangeTrackingProvider, ColumnMask,
    DeleteCommand, Error, PrimaryKey, ResetCommand, Row, RowVersion, ScopeId, SelectInitial,
    StoreTransaction, SyncStore, TableName, TableSchema, Timestamp, UpsertCommand,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
struct LogEntry {
    key: PrimaryKey,
    timestamp: Timestamp,
    operation: ChangeOperation,
    origin: Option<ScopeId>,
    mask: Option<ColumnMask>,
}

#[derive(Debug, Clone)]
struct Tracking {
    timestamp: Timestamp,
    origin: Option<ScopeId>,
}

#[derive(Debug, Clone, Default)]
struct TableState {
    rows: BTreeMap<PrimaryKey, Row>,
    tracking: BTreeMap<PrimaryKey, Tracking>,
    log: Vec<LogEntry>,
    min_valid: Timestamp,
}

impl TableState {
    fn row_version(&self, key: &PrimaryKey) -> Option<RowVersion> {
        let exists = self.rows.contains_key(key);
        match self.tracking.get(key) {
            Some(t) => Some(RowVersion {
                timestamp: Some(t.timestamp),
                origin_scope: t.origin.clone(),
                exists,
            }),
            None if exists => Some(RowVersion {
                timestamp: None,
                origin_scope: None,
                exists,
            }),
            None => None,
        }
    }

    fn record(
        &mut self,
        key: PrimaryKey,
        timestamp: Timestamp,
        operation: ChangeOperation,
        origin: Option<ScopeId>,
        mask: Option<ColumnMask>,
    ) {
        self.tracking.insert(
            key.clone(),
            Tracking {
                timestamp,
                origin: origin.clone(),
            },
        );
        self.log.push(LogEntry {
            key,
            timestamp,
            operation,
            origin,
            mask,
        });
    }

    /// Write `values` into the row, inserting it when absent.
    fn write(
        &mut self,
        schema: &TableSchema,
        key: &PrimaryKey,
        values: &Row,
        timestamp: Timestamp,
        origin: Option<ScopeId>,
    ) {
        let mask = schema
            .has_column_change_tracking()
            .then(|| ColumnMask::of(values.keys().cloned()));

        let operation = match self.rows.get_mut(key) {
            Some(row) => {
                row.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                ChangeOperation::Update
            }
            None => {
                self.rows.insert(key.clone(), schema.compose_row(key, values));
                ChangeOperation::Insert
            }
        };

        self.record(key.clone(), timestamp, operation, origin, mask);
    }

    fn net_changes(&self, min_timestamp: Timestamp) -> Vec<ChangeEntry> {
        struct Acc {
            saw_insert: bool,
            last: LogEntry,
            mask: Option<ColumnMask>,
            mask_known: bool,
        }

        let mut by_key: BTreeMap<&PrimaryKey, Acc> = BTreeMap::new();
        for entry in self.log.iter().filter(|e| e.timestamp > min_timestamp) {
            let acc = by_key.entry(&entry.key).or_insert_with(|| Acc {
                saw_insert: false,
                last: entry.clone(),
                mask: None,
                mask_known: true,
            });

            acc.saw_insert |= entry.operation == ChangeOperation::Insert;
            if entry.operation == ChangeOperation::Update {
                match &entry.mask {
                    Some(mask) if acc.mask_known => {
                        acc.mask.get_or_insert_with(ColumnMask::new).union(mask);
                    }
                    _ => acc.mask_known = false,
                }
            }
            acc.last = entry.clone();
        }

        let mut changes: Vec<ChangeEntry> = by_key
            .into_values()
            .map(|acc| {
                let operation = if acc.last.operation == ChangeOperation::Delete {
                    ChangeOperation::Delete
                } else if acc.saw_insert {
                    ChangeOperation::Insert
                } else {
                    ChangeOperation::Update
                };
                ChangeEntry {
                    primary_key: acc.last.key,
                    timestamp: acc.last.timestamp,
                    origin_scope: acc.last.origin,
                    operation,
                    changed_columns: if acc.mask_known { acc.mask } else { None },
                }
            })
            .collect();

        changes.sort_by_key(|c| c.timestamp);
        changes
    }
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    clock: Timestamp,
    tables: HashMap<TableName, TableState>,
}

impl StoreState {
    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        self.clock
    }

    fn table(&self, name: &str) -> Result<&TableState> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableState> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }
}

/// Failure injection for exercising the engine's error paths.
#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_commits: AtomicUsize,
    write_countdown: AtomicUsize,
    latency_ms: AtomicU64,
}

/// Thread-safe in-memory store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table and start tracking it.
    pub async fn create_table(&self, schema: &TableSchema) {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(schema.name().clone())
            .or_insert_with(TableState::default);
    }

    // Local (non-sync) writes, stamped with no origin.

    /// Insert a row as a local application write.
    pub async fn insert(&self, schema: &TableSchema, row: Row) -> Result<Timestamp> {
        let key = schema.key_of(&row)?;
        let values: Row = row
            .into_iter()
            .filter(|(name, _)| schema.column(name).is_some_and(|c| !c.is_primary_key))
            .collect();
        self.local_write(schema, &key, &values).await
    }

    /// Update columns of a row as a local application write. Any non-key
    /// column may be written, including read-only ones.
    pub async fn update(
        &self,
        schema: &TableSchema,
        key: &PrimaryKey,
        values: Row,
    ) -> Result<Timestamp> {
        for name in values.keys() {
            if !schema.column(name).is_some_and(|c| !c.is_primary_key) {
                return Err(Error::invalid_change(
                    schema.name().clone(),
                    format!("cannot write column '{name}'"),
                ));
            }
        }
        self.local_write(schema, key, &values).await
    }

    async fn local_write(
        &self,
        schema: &TableSchema,
        key: &PrimaryKey,
        values: &Row,
    ) -> Result<Timestamp> {
        schema.validate_key(key)?;
        let mut state = self.state.lock().await;
        let ts = state.tick();
        state
            .table_mut(schema.name())?
            .write(schema, key, values, ts, None);
        Ok(ts)
    }

    /// Delete a row as a local application write.
    pub async fn delete(&self, schema: &TableSchema, key: &PrimaryKey) -> Result<Timestamp> {
        let mut state = self.state.lock().await;
        let ts = state.tick();
        let table = state.table_mut(schema.name())?;
        table.rows.remove(key);
        table.record(key.clone(), ts, ChangeOperation::Delete, None, None);
        Ok(ts)
    }

    /// Insert a row that predates change tracking: no tracking version and
    /// no feed entry.
    pub async fn insert_untracked(&self, schema: &TableSchema, row: Row) -> Result<()> {
        let key = schema.key_of(&row)?;
        let mut state = self.state.lock().await;
        state.table_mut(schema.name())?.rows.insert(key, row);
        Ok(())
    }

    pub async fn row(&self, schema: &TableSchema, key: &PrimaryKey) -> Option<Row> {
        let state = self.state.lock().await;
        state.table(schema.name()).ok()?.rows.get(key).cloned()
    }

    pub async fn row_version(&self, schema: &TableSchema, key: &PrimaryKey) -> Option<RowVersion> {
        let state = self.state.lock().await;
        state.table(schema.name()).ok()?.row_version(key)
    }

    pub async fn row_count(&self, schema: &TableSchema) -> usize {
        let state = self.state.lock().await;
        state
            .table(schema.name())
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    // Fault injection.

    /// Make every provider and storage call fail with `ProviderUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` commits with `TransientApplyFailure`.
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the `nth` transactional write from now (1-based) with
    /// `TransientApplyFailure`.
    pub fn fail_write_at(&self, nth: usize) {
        self.faults.write_countdown.store(nth, Ordering::SeqCst);
    }

    /// Delay every provider call.
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn io(&self) -> Result<()> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(Error::ProviderUnavailable("memory store offline".into()));
        }
        Ok(())
    }
}

/// Consume one pending injected failure, if any.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Step a countdown; true when it reaches zero on this call.
fn countdown(counter: &AtomicUsize) -> bool {
    matches!(
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)),
        Ok(1)
    )
}

#[async_trait]
impl ChangeTrackingProvider for MemoryStore {
    async fn changes_since(
        &self,
        table: &TableSchema,
        min_timestamp: Timestamp,
    ) -> Result<Vec<ChangeEntry>> {
        self.io().await?;
        let state = self.state.lock().await;
        Ok(state.table(table.name())?.net_changes(min_timestamp))
    }

    async fn current_timestamp(&self) -> Result<Timestamp> {
        self.io().await?;
        Ok(self.state.lock().await.clock)
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn min_valid_timestamp(&self, table: &TableSchema) -> Result<Timestamp> {
        self.io().await?;
        let state = self.state.lock().await;
        Ok(state.table(table.name())?.min_valid)
    }

    async fn scan(&self, table: &TableSchema, command: &SelectInitial) -> Result<Vec<Row>> {
        self.io().await?;
        let state = self.state.lock().await;
        let rows = state
            .table(table.name())?
            .rows
            .values()
            .filter(|row| command.filter.as_ref().map_or(true, |f| f.matches(row)))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn fetch_rows(
        &self,
        table: &TableSchema,
        keys: &[PrimaryKey],
    ) -> Result<BTreeMap<PrimaryKey, Row>> {
        self.io().await?;
        let state = self.state.lock().await;
        let rows = &state.table(table.name())?.rows;
        Ok(keys
            .iter()
            .filter_map(|k| rows.get(k).map(|r| (k.clone(), r.clone())))
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        self.io().await?;
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            faults: self.faults.clone(),
        }))
    }

    async fn reset(&self, table: &TableSchema, command: &ResetCommand) -> Result<Timestamp> {
        self.io().await?;
        let mut state = self.state.lock().await;
        let epoch = state.clock;
        let table_state = state.table_mut(&command.table)?;
        table_state.log.clear();
        table_state.tracking.clear();
        table_state.min_valid = epoch;

        tracing::info!(table = %table.name(), epoch, "Reset change tracking");
        Ok(epoch)
    }
}

/// A transaction over a private copy of the store state.
struct MemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
    faults: Arc<Faults>,
}

impl MemoryTransaction {
    fn check_write(&self) -> Result<()> {
        if countdown(&self.faults.write_countdown) {
            return Err(Error::TransientApplyFailure("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn row_version(
        &mut self,
        table: &TableSchema,
        key: &PrimaryKey,
    ) -> Result<Option<RowVersion>> {
        Ok(self.working.table(table.name())?.row_version(key))
    }

    async fn upsert(&mut self, table: &TableSchema, command: &UpsertCommand) -> Result<()> {
        self.check_write()?;
        let ts = self.working.tick();
        self.working.table_mut(&command.table)?.write(
            table,
            &command.primary_key,
            &command.values,
            ts,
            Some(command.origin().clone()),
        );
        Ok(())
    }

    async fn delete(&mut self, _table: &TableSchema, command: &DeleteCommand) -> Result<bool> {
        self.check_write()?;
        let ts = self.working.tick();
        let table = self.working.table_mut(&command.table)?;
        let removed = table.rows.remove(&command.primary_key).is_some();
        table.record(
            command.primary_key.clone(),
            ts,
            ChangeOperation::Delete,
            Some(command.origin().clone()),
            None,
        );
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<Timestamp> {
        if take_fault(&self.faults.fail_commits) {
            return Err(Error::TransientApplyFailure("injected commit failure".into()));
        }
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        let committed_at = working.clock;
        *guard = working;
        Ok(committed_at)
    }
}
