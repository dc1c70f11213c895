//! Synchronization sessions.
//!
//! A [`SyncSession`] pulls one table's changes from a source store into a
//! destination store on behalf of one scope pair. It is a sequential
//! pipeline: fetch, resolve, apply, advance. Sessions for different source
//! scopes may run concurrently against the same destination; the
//! destination's [`ScopeRegistry`] serializes watermark advancement per
//! scope.

use crate::{
    apply::cancellable, error::Result, ApplyOutcome, BatchApplier, BatchRequest, ChangeBatch,
    ChangeSelector, CommandGenerator, Conflict, EngineConfig, RowFilter, RowStatus, ScopeId,
    ScopeRegistry, SyncStore, TableSchema, Timestamp, WatermarkAdvance,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A store together with the registry that names it.
#[derive(Clone, Copy)]
pub struct Peer<'a> {
    pub store: &'a dyn SyncStore,
    pub registry: &'a ScopeRegistry,
}

impl<'a> Peer<'a> {
    pub fn new(store: &'a dyn SyncStore, registry: &'a ScopeRegistry) -> Self {
        Self { store, registry }
    }

    pub fn scope_id(&self) -> &'a ScopeId {
        self.registry.local_scope()
    }
}

/// Summary of one pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// Source scope the changes came from.
    pub scope_id: ScopeId,
    /// Whether the pull was a full initial read.
    pub initial: bool,
    pub batches: usize,
    pub outcomes: Vec<ApplyOutcome>,
    pub conflicts: Vec<Conflict>,
    /// Destination's watermark for the source scope after the pull.
    pub watermark: Timestamp,
}

impl SessionReport {
    pub fn count(&self, status: RowStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Both halves of a [`SyncSession::sync`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pushed: SessionReport,
    pub pulled: SessionReport,
}

/// Synchronization of a table from `source` to `destination`.
pub struct SyncSession<'a> {
    source: Peer<'a>,
    destination: Peer<'a>,
    schema: TableSchema,
    config: &'a EngineConfig,
    filter: Option<RowFilter>,
}

impl<'a> SyncSession<'a> {
    pub fn new(
        source: Peer<'a>,
        destination: Peer<'a>,
        schema: TableSchema,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            source,
            destination,
            schema,
            config,
            filter: None,
        }
    }

    /// Restrict the rows served to this session.
    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// The same session in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            schema: self.schema.clone(),
            config: self.config,
            filter: self.filter.clone(),
        }
    }

    /// Pull every change the destination has not seen yet.
    ///
    /// Cancelling through `cancel` abandons the batch in flight; batches
    /// already committed keep their watermark.
    pub async fn pull(&self, cancel: &CancellationToken) -> Result<SessionReport> {
        let source_scope = self.source.scope_id();
        let registry = self.destination.registry;

        let scope = registry.ensure_scope(source_scope).await?;
        let min_valid =
            cancellable(cancel, self.source.store.min_valid_timestamp(&self.schema)).await?;

        let generator = CommandGenerator::new(self.schema.clone());
        let selector = ChangeSelector::new(self.source.store, Some(source_scope));

        let initial = scope.last_watermark == 0 || scope.last_watermark < min_valid;
        let batch = if initial {
            if scope.last_watermark > 0 {
                tracing::info!(
                    table = %self.schema.name(),
                    scope = %source_scope,
                    watermark = scope.last_watermark,
                    min_valid,
                    "Watermark predates change tracking reset; reinitializing"
                );
            }
            let command = generator.select_initial(self.filter.clone())?;
            cancellable(cancel, selector.select_initial(&self.schema, &command)).await?
        } else {
            let mut command = generator.select_incremental(
                scope.last_watermark,
                registry.local_scope().clone(),
                self.filter.clone(),
            )?;
            command.use_column_masks &= self.config.trust_column_masks;
            cancellable(cancel, selector.select_incremental(&self.schema, &command)).await?
        };

        tracing::info!(
            table = %self.schema.name(),
            scope = %source_scope,
            initial,
            changes = batch.changes.len(),
            upper_bound = batch.upper_bound,
            "Pulling changes"
        );

        let mut report = SessionReport {
            scope_id: source_scope.clone(),
            initial,
            watermark: scope.last_watermark,
            ..Default::default()
        };

        let applier = BatchApplier::new(self.destination.store, registry, self.schema.clone());
        for request in self.plan_batches(source_scope, scope.local_anchor, initial, batch) {
            let batch_report = applier.apply_batch(&request, cancel).await?;
            report.batches += 1;
            report.watermark = batch_report.watermark;
            report.outcomes.extend(batch_report.outcomes);
            report.conflicts.extend(batch_report.conflicts);
        }

        Ok(report)
    }

    /// Push the destination's changes to the source, then pull.
    ///
    /// Once the push commits, the source has every destination change up to
    /// the push watermark. The destination's anchor is raised to it, so the
    /// pull only treats later local writes as conflicts and rows the source
    /// kept in a conflict converge to the source's version.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let pushed = self.reversed().pull(cancel).await?;
        self.destination
            .registry
            .raise_local_anchor(self.source.scope_id(), pushed.watermark)
            .await?;
        let pulled = self.pull(cancel).await?;
        Ok(SyncReport { pushed, pulled })
    }

    /// Split a change batch into apply requests of at most `batch_size`
    /// rows.
    ///
    /// The last request advances the watermark to the batch's upper bound.
    /// Earlier requests of an incremental pull advance to just below the
    /// next request's first timestamp; earlier requests of an initial pull
    /// hold the watermark, since all of its rows share one timestamp.
    fn plan_batches(
        &self,
        scope_id: &ScopeId,
        local_anchor: Timestamp,
        initial: bool,
        batch: ChangeBatch,
    ) -> Vec<BatchRequest> {
        let ChangeBatch {
            changes,
            upper_bound,
        } = batch;

        if changes.is_empty() {
            return vec![BatchRequest::new(scope_id.clone(), local_anchor, Vec::new())
                .advance(WatermarkAdvance::To(upper_bound))];
        }

        let size = self.config.batch_size.max(1);
        let chunks: Vec<_> = changes.chunks(size).map(<[_]>::to_vec).collect();
        let firsts: Vec<Timestamp> = chunks.iter().map(|c| c[0].timestamp).collect();

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, rows)| {
                let advance = match firsts.get(i + 1) {
                    None => WatermarkAdvance::To(upper_bound),
                    Some(_) if initial => WatermarkAdvance::Hold,
                    Some(next) => WatermarkAdvance::To(next.saturating_sub(1)),
                };
                BatchRequest::new(scope_id.clone(), local_anchor, rows)
                    .initial(initial)
                    .advance(advance)
            })
            .collect()
    }
}

/// Drop a table's tracked state on `store` and start a new tracking epoch.
///
/// Every scope whose watermark predates the new epoch reinitializes on its
/// next pull.
pub async fn reset_table(store: &dyn SyncStore, schema: &TableSchema) -> Result<Timestamp> {
    let command = CommandGenerator::new(schema.clone()).reset();
    let epoch = store.reset(schema, &command).await?;
    tracing::info!(table = %schema.name(), epoch, "Change tracking reset");
    Ok(epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::{ChangeRecord, Column, ColumnType, PrimaryKey, Row};

    fn schema() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                Column::key("id", ColumnType::Int),
                Column::mutable("name", ColumnType::String),
            ],
        )
        .unwrap()
    }

    fn changes(timestamps: &[Timestamp]) -> Vec<ChangeRecord> {
        timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| {
                ChangeRecord::upsert(PrimaryKey::single(i as i64), Row::new(), None, *ts)
            })
            .collect()
    }

    fn plan(initial: bool, timestamps: &[Timestamp], batch_size: usize) -> Vec<BatchRequest> {
        let store = MemoryStore::new();
        let registry = ScopeRegistry::in_memory("a");
        let config = EngineConfig {
            batch_size,
            ..Default::default()
        };
        let peer = Peer::new(&store, &registry);
        let session = SyncSession::new(peer, peer, schema(), &config);
        let batch = ChangeBatch {
            changes: changes(timestamps),
            upper_bound: 20,
        };
        session.plan_batches(&"b".to_string(), 3, initial, batch)
    }

    #[test]
    fn incremental_batches_advance_below_next_batch() {
        let requests = plan(false, &[4, 6, 9, 12, 15], 2);
        let advances: Vec<_> = requests.iter().map(|r| r.advance).collect();
        assert_eq!(
            advances,
            vec![
                WatermarkAdvance::To(8),
                WatermarkAdvance::To(14),
                WatermarkAdvance::To(20),
            ]
        );
        assert!(requests.iter().all(|r| r.min_timestamp == 3 && !r.initial));
    }

    #[test]
    fn initial_batches_hold_until_the_last() {
        let requests = plan(true, &[20, 20, 20], 2);
        let advances: Vec<_> = requests.iter().map(|r| r.advance).collect();
        assert_eq!(advances, vec![WatermarkAdvance::Hold, WatermarkAdvance::To(20)]);
        assert!(requests.iter().all(|r| r.initial));
    }

    #[test]
    fn empty_pull_still_advances() {
        let requests = plan(false, &[], 2);
        assert_eq!(requests.len(), 1);
        assert!(requests[0].rows.is_empty());
        assert_eq!(requests[0].advance, WatermarkAdvance::To(20));
    }
}
