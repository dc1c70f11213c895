//! Batch application of incoming changes.
//!
//! A batch is applied inside one store transaction. Every row goes through
//! [`resolve`]; rows that pass are written, the rest are reported. Any
//! storage failure drops the transaction, which rolls the whole batch back
//! and leaves the scope's watermark untouched. Only after a successful
//! commit is the watermark advanced.

use crate::{
    error::Result, resolve, ApplyCommand, ApplyOutcome, ApplyParams, ChangeRecord,
    CommandGenerator, Error, PrimaryKey, Resolution, ResolveContext, RowStatus, RowVersion,
    ScopeId, ScopeRegistry, SyncCommand, SyncStore, TableSchema, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `fut` unless `cancel` fires first.
///
/// A cancelled future is dropped, which rolls back any transaction it holds.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Where the scope's watermark moves after a committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum WatermarkAdvance {
    /// Highest timestamp among the batch's rows.
    #[default]
    ToMaxRowTimestamp,
    To(Timestamp),
    /// Leave the watermark where it is.
    Hold,
}

/// Changes from one scope to apply in a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Scope the changes come from.
    pub scope_id: ScopeId,
    /// Local timestamp the scope last synchronized at.
    pub min_timestamp: Timestamp,
    pub force_write: bool,
    /// Rows come from a full initial read of the scope.
    #[serde(default)]
    pub initial: bool,
    pub advance: WatermarkAdvance,
    pub rows: Vec<ChangeRecord>,
}

impl BatchRequest {
    pub fn new(
        scope_id: impl Into<ScopeId>,
        min_timestamp: Timestamp,
        rows: Vec<ChangeRecord>,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            min_timestamp,
            force_write: false,
            initial: false,
            advance: WatermarkAdvance::default(),
            rows,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_write = true;
        self
    }

    pub fn initial(mut self, initial: bool) -> Self {
        self.initial = initial;
        self
    }

    pub fn advance(mut self, advance: WatermarkAdvance) -> Self {
        self.advance = advance;
        self
    }

    fn params(&self) -> ApplyParams {
        ApplyParams {
            expected_min_timestamp: self.min_timestamp,
            requesting_scope: self.scope_id.clone(),
            force_write: self.force_write,
            initial: self.initial,
        }
    }

    fn target_watermark(&self) -> Option<Timestamp> {
        match self.advance {
            WatermarkAdvance::ToMaxRowTimestamp => self.rows.iter().map(|r| r.timestamp).max(),
            WatermarkAdvance::To(t) => Some(t),
            WatermarkAdvance::Hold => None,
        }
    }
}

/// A rejected row: the local version that won and the change that lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub primary_key: PrimaryKey,
    pub local: RowVersion,
    pub incoming: ChangeRecord,
}

/// Result of a committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// One outcome per request row, in request order.
    pub outcomes: Vec<ApplyOutcome>,
    pub conflicts: Vec<Conflict>,
    /// The scope's watermark after the batch.
    pub watermark: Timestamp,
    /// Local commit timestamp; `None` when nothing was written.
    pub committed_at: Option<Timestamp>,
}

impl BatchReport {
    pub fn count(&self, status: RowStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

struct Committed {
    outcomes: Vec<ApplyOutcome>,
    conflicts: Vec<Conflict>,
    committed_at: Timestamp,
}

/// Applies batches of changes to one table of a store.
pub struct BatchApplier<'a> {
    store: &'a dyn SyncStore,
    registry: &'a ScopeRegistry,
    generator: CommandGenerator,
}

impl<'a> BatchApplier<'a> {
    pub fn new(store: &'a dyn SyncStore, registry: &'a ScopeRegistry, schema: TableSchema) -> Self {
        Self {
            store,
            registry,
            generator: CommandGenerator::new(schema),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        self.generator.schema()
    }

    /// The request as batch commands, for backends that execute commands
    /// themselves. Consecutive upserts and deletes are grouped.
    pub fn render(&self, request: &BatchRequest) -> Result<Vec<SyncCommand>> {
        let mut rendered: Vec<SyncCommand> = Vec::new();
        for command in self.generator.apply_commands(&request.rows, &request.params())? {
            match (rendered.last_mut(), command) {
                (Some(SyncCommand::UpsertBatch { commands }), ApplyCommand::Upsert(cmd)) => {
                    commands.push(cmd)
                }
                (Some(SyncCommand::DeleteBatch { commands }), ApplyCommand::Delete(cmd)) => {
                    commands.push(cmd)
                }
                (_, ApplyCommand::Upsert(cmd)) => {
                    rendered.push(SyncCommand::UpsertBatch { commands: vec![cmd] })
                }
                (_, ApplyCommand::Delete(cmd)) => {
                    rendered.push(SyncCommand::DeleteBatch { commands: vec![cmd] })
                }
            }
        }
        Ok(rendered)
    }

    /// Apply a batch atomically and advance the scope's watermark.
    ///
    /// Returns one outcome per row. Conflicts are outcomes, not errors. On
    /// any error nothing is written and the watermark is unchanged.
    pub async fn apply_batch(
        &self,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let params = request.params();
        let commands = self.generator.apply_commands(&request.rows, &params)?;

        let target = request.target_watermark();
        let current = self.registry.get_watermark(&request.scope_id).await?;
        if let Some(target) = target {
            if target < current {
                return Err(Error::OutOfOrderWatermark {
                    scope: request.scope_id.clone(),
                    current,
                    attempted: target,
                });
            }
        }

        let committed = if commands.is_empty() {
            None
        } else {
            match cancellable(cancel, self.run(request, commands, &params)).await {
                Ok(committed) => Some(committed),
                Err(err) => {
                    tracing::warn!(
                        table = %self.schema().name(),
                        scope = %request.scope_id,
                        rows = request.rows.len(),
                        error = %err,
                        "Rolled back batch"
                    );
                    return Err(err);
                }
            }
        };

        let committed_at = committed.as_ref().map(|c| c.committed_at);
        let watermark = match target {
            Some(target) => {
                self.registry
                    .advance(&request.scope_id, target, committed_at)
                    .await?
                    .last_watermark
            }
            None => current,
        };

        let (outcomes, conflicts) = committed
            .map(|c| (c.outcomes, c.conflicts))
            .unwrap_or_default();
        let report = BatchReport {
            outcomes,
            conflicts,
            watermark,
            committed_at,
        };

        tracing::info!(
            table = %self.schema().name(),
            scope = %request.scope_id,
            applied = report.count(RowStatus::Applied),
            tombstones = report.count(RowStatus::AppliedTombstone),
            echoes = report.count(RowStatus::SkippedEcho),
            conflicts = report.conflicts.len(),
            watermark,
            "Applied batch"
        );

        Ok(report)
    }

    async fn run(
        &self,
        request: &BatchRequest,
        commands: Vec<ApplyCommand>,
        params: &ApplyParams,
    ) -> Result<Committed> {
        let schema = self.schema();
        let ctx = ResolveContext::new(Some(self.registry.local_scope()), params);

        let mut tx = self.store.begin().await?;
        let mut outcomes = Vec::with_capacity(commands.len());
        let mut conflicts = Vec::new();

        for (change, command) in request.rows.iter().zip(commands) {
            let key = command.primary_key().clone();
            let local = tx.row_version(schema, &key).await?;

            let status = match resolve(&ctx, change, local.as_ref()) {
                Resolution::SkipEcho => RowStatus::SkippedEcho,
                Resolution::Conflict => {
                    tracing::warn!(
                        table = %schema.name(),
                        key = %key,
                        scope = %request.scope_id,
                        local_timestamp = ?local.as_ref().and_then(|l| l.timestamp),
                        "Rejected conflicting change"
                    );
                    if let Some(local) = local {
                        conflicts.push(Conflict {
                            primary_key: key.clone(),
                            local,
                            incoming: change.clone(),
                        });
                    }
                    RowStatus::ConflictRejected
                }
                Resolution::Apply => match command {
                    ApplyCommand::Upsert(cmd) => {
                        tx.upsert(schema, &cmd).await?;
                        RowStatus::Applied
                    }
                    ApplyCommand::Delete(cmd) => {
                        tx.delete(schema, &cmd).await?;
                        RowStatus::AppliedTombstone
                    }
                },
            };

            tracing::debug!(key = %key, ?status, "Resolved row");
            outcomes.push(ApplyOutcome::new(key, status));
        }

        let committed_at = tx.commit().await?;
        Ok(Committed {
            outcomes,
            conflicts,
            committed_at,
        })
    }

    /// Re-submit rejected changes with the conflict predicate overridden.
    ///
    /// The watermark is held: the conflicts were already covered by the
    /// batch that reported them.
    pub async fn replay_conflicts(
        &self,
        scope_id: &str,
        conflicts: &[Conflict],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let rows = conflicts.iter().map(|c| c.incoming.clone()).collect();
        let request = BatchRequest::new(scope_id, 0, rows)
            .forced()
            .advance(WatermarkAdvance::Hold);

        tracing::info!(scope = %scope_id, conflicts = conflicts.len(), "Replaying conflicts");
        self.apply_batch(&request, cancel).await
    }
}
