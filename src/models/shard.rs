//! Represents a remote, size-bounded container holding chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A shard (remote repository) owned by one account.
///
/// `cumulative_bytes` only grows. Once it passes the rotation threshold the
/// shard is sealed and never written again.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Shard {
    pub id: i64,
    pub account_id: i64,
    pub name: String,

    /// Browser-facing URL of the remote container, e.g.
    /// `https://github.com/<identity>/<name>`.
    pub external_url: String,

    pub cumulative_bytes: i64,
    pub sealed: bool,
    pub created_at: DateTime<Utc>,
}
