//! Credentials used to operate shards on the remote host.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::fmt;

/// A remote-host account. Provisioned and assigned outside the engine.
#[derive(Clone, FromRow)]
pub struct Account {
    pub id: i64,

    /// Login name on the remote host; also the owner segment of shard URLs.
    pub identity: String,

    /// Commit author email used in staging clones.
    pub email: String,

    pub secret_token: String,
    pub created_at: DateTime<Utc>,
}

// Hand-written so the token never reaches logs.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}
