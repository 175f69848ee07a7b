//! Defines routes for chunked file transfers.
//!
//! ## Structure
//! - **Container-level endpoints**
//!   - `POST   /containers/{container_id}/files` - upload (or resume) a file
//!   - `DELETE /containers/{container_id}/files` - delete files by id
//!
//! - **File-level endpoints**
//!   - `GET    /containers/{container_id}/files/{file_id}` - download, honours `Range`
//!   - `GET    /containers/{container_id}/files/{file_id}/resume` - upload progress

use crate::{
    handlers::{
        file_handlers::{delete_files, download_file, resume_status, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::engine::StorageEngine,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Every handler shares the `StorageEngine` state.
pub fn routes() -> Router<StorageEngine> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Container-level routes
        .route(
            "/containers/{container_id}/files",
            post(upload_file).delete(delete_files),
        )
        // File-level routes
        .route(
            "/containers/{container_id}/files/{file_id}",
            get(download_file),
        )
        .route(
            "/containers/{container_id}/files/{file_id}/resume",
            get(resume_status),
        )
}
