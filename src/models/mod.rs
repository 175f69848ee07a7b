//! Ledger entities for the chunked transfer engine.
//!
//! These map one-to-one onto the SQLite tables in `migrations/0001_init.sql`
//! via `sqlx::FromRow` and serialize as JSON via `serde` for the HTTP layer.

pub mod account;
pub mod chunk;
pub mod file;
pub mod shard;
