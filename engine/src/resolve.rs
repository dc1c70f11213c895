//! Conflict and echo resolution.
//!
//! Every incoming change, upsert or delete alike, goes through
//! [`resolve`] before the store is touched.
//!
//! # Rule
//!
//! 1. A change that originated in the destination scope is an echo and is
//!    skipped. Only a forced tombstone may pass, or a row from an initial
//!    read that the destination has no trace of (a re-provisioned store
//!    getting its own rows back).
//! 2. Otherwise the change is applied when any of these hold:
//!    - `force_write` is set
//!    - there is no local tracking timestamp for the row
//!    - the local timestamp is at or below the expected minimum (the local
//!      copy has not changed since the caller last saw it)
//!    - the local copy was last written by the requesting scope itself
//! 3. Anything else is a conflict.
//!
//! This is last-writer-wins with self-exemption: a later local write from an
//! unrelated scope is never clobbered by a stale remote write.

use crate::{ApplyParams, ChangeRecord, RowVersion, ScopeId};
use serde::{Deserialize, Serialize};

/// Decision for one incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    Apply,
    SkipEcho,
    Conflict,
}

/// Everything the rule needs besides the change and the local version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveContext<'a> {
    /// Scope id of the destination store, if it has one.
    pub local_scope: Option<&'a ScopeId>,
    pub params: &'a ApplyParams,
}

impl<'a> ResolveContext<'a> {
    pub fn new(local_scope: Option<&'a ScopeId>, params: &'a ApplyParams) -> Self {
        Self {
            local_scope,
            params,
        }
    }
}

/// Decide what to do with `change` given the local row's tracking data.
pub fn resolve(
    ctx: &ResolveContext<'_>,
    change: &ChangeRecord,
    local: Option<&RowVersion>,
) -> Resolution {
    let params = ctx.params;

    if let Some(local_scope) = ctx.local_scope {
        let forced_tombstone = params.force_write && change.is_tombstone;
        let restored = params.initial && local.is_none();
        if change.originated_in(local_scope) && !forced_tombstone && !restored {
            return Resolution::SkipEcho;
        }
    }

    if params.force_write {
        return Resolution::Apply;
    }

    let Some(local) = local else {
        return Resolution::Apply;
    };

    let unchanged_since_last_sync = match local.timestamp {
        None => true,
        Some(ts) => ts <= params.expected_min_timestamp,
    };
    if unchanged_since_last_sync {
        return Resolution::Apply;
    }

    if local.origin_scope.as_ref() == Some(&params.requesting_scope) {
        return Resolution::Apply;
    }

    Resolution::Conflict
}
