pub mod chunker;
pub mod download_service;
pub mod engine;
pub mod file_service;
pub mod ledger;
pub mod object_store;
pub mod remote;
pub mod retry;
pub mod upload_service;

#[cfg(test)]
pub(crate) mod memory_host;
