//! # Tablesync Engine
//!
//! Table-level change-tracking synchronization between independent stores.
//!
//! Every participating store is a *scope* with a stable id. A scope pulls a
//! table's changes from a peer through the peer's change feed, applies them
//! under a conflict predicate, and remembers how far it got as a
//! *watermark*. Changes are tagged with the scope that made them, so a scope
//! is never served its own writes back.
//!
//! ## Core Concepts
//!
//! ### Schema
//!
//! A [`TableSchema`] lists a table's columns, which of them form the primary
//! key and which may be written by synchronization. Schemas are data and are
//! supplied by the caller.
//!
//! ### Change feed and store
//!
//! Backends implement [`ChangeTrackingProvider`] (the per-row change log)
//! and [`SyncStore`] (row access and transactions). [`memory::MemoryStore`]
//! is the in-memory reference backend.
//!
//! ### Commands
//!
//! [`CommandGenerator`] describes every read and write as a plain-data
//! [`SyncCommand`]: select-initial, select-incremental, upsert, delete,
//! their batch forms and reset.
//!
//! ### Resolution
//!
//! [`resolve`] decides per incoming row whether to apply it, skip it as an
//! echo, or reject it as a conflict with a newer local write.
//!
//! ### Scopes and watermarks
//!
//! [`ScopeRegistry`] owns the per-scope watermarks. They only move forward
//! and only after the covered changes are durably applied.
//!
//! ## Quick Start
//!
//! ```rust
//! use tablesync_engine::{
//!     memory::MemoryStore, Column, ColumnType, EngineConfig, Peer, ScopeRegistry,
//!     SyncSession, TableSchema,
//! };
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! // 1. Define a schema
//! let schema = TableSchema::new(
//!     "users",
//!     vec![
//!         Column::key("id", ColumnType::Int),
//!         Column::mutable("name", ColumnType::String),
//!     ],
//! )
//! .unwrap();
//!
//! // 2. Two stores, each with its own scope registry
//! let (store_a, store_b) = (MemoryStore::new(), MemoryStore::new());
//! store_a.create_table(&schema).await;
//! store_b.create_table(&schema).await;
//! let (scopes_a, scopes_b) = (ScopeRegistry::in_memory("a"), ScopeRegistry::in_memory("b"));
//!
//! // 3. Write locally on A
//! let row = serde_json::from_value(json!({"id": 1, "name": "x"})).unwrap();
//! store_a.insert(&schema, row).await.unwrap();
//!
//! // 4. Pull A's changes into B
//! let config = EngineConfig::default();
//! let session = SyncSession::new(
//!     Peer::new(&store_a, &scopes_a),
//!     Peer::new(&store_b, &scopes_b),
//!     schema.clone(),
//!     &config,
//! );
//! let report = session.pull(&CancellationToken::new()).await.unwrap();
//! assert!(report.initial);
//! assert_eq!(store_b.row_count(&schema).await, 1);
//! # });
//! ```
//!
//! ## Persistence
//!
//! Scope records live in a [`ScopeStore`]. [`snapshot::JsonFileScopeStore`]
//! persists them as a versioned [`ScopeSnapshot`] JSON file.

pub mod apply;
pub mod change;
pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod memory;
pub mod provider;
pub mod resolve;
pub mod schema;
pub mod scope;
pub mod select;
pub mod session;
pub mod snapshot;
pub mod value;

// Re-export main types at crate root
pub use apply::{BatchApplier, BatchReport, BatchRequest, Conflict, WatermarkAdvance};
pub use change::{ApplyOutcome, ChangeRecord, RowStatus};
pub use command::{
    ApplyCommand, ApplyParams, CommandGenerator, DeleteCommand, ResetCommand, SelectIncremental,
    SelectInitial, SyncCommand, UpsertCommand,
};
pub use config::{ConfigError, EngineConfig};
pub use error::{Error, ErrorKind};
pub use filter::RowFilter;
pub use provider::{
    ChangeEntry, ChangeOperation, ChangeTrackingProvider, ColumnMask, RowVersion,
    StoreTransaction, SyncStore,
};
pub use resolve::{resolve, Resolution, ResolveContext};
pub use schema::{Column, ColumnType, TableSchema};
pub use scope::{new_scope_id, ScopeRegistry, ScopeStore, SyncScope};
pub use select::{plan_entry, ChangeBatch, ChangeSelector, EntryPlan, SkipReason};
pub use session::{reset_table, Peer, SessionReport, SyncReport, SyncSession};
pub use snapshot::{ScopeSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use value::{KeyValue, PrimaryKey, Row};

/// Type aliases for clarity
pub type ScopeId = String;
pub type TableName = String;
pub type ColumnName = String;
pub type Timestamp = u64;
