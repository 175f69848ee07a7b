//! HTTP handlers for chunked file transfers.
//! Request bodies are streamed straight into the chunker and download bodies
//! are streamed straight out of the shards; nothing is buffered whole.

use crate::{
    errors::AppError,
    services::{
        download_service::{Download, DownloadRequest},
        engine::StorageEngine,
        file_service::{DeleteSummary, ResumeStatus},
        upload_service::{UploadReceipt, UploadRequest},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::TryStreamExt;
use serde::Deserialize;
use std::io;

const USER_ID: HeaderName = HeaderName::from_static("x-user-id");
const ACCOUNT_ID: HeaderName = HeaderName::from_static("x-account-id");
const FILE_NAME: HeaderName = HeaderName::from_static("x-file-name");
const FILE_ID: HeaderName = HeaderName::from_static("x-file-id");

/// Request body for `DELETE /containers/{container_id}/files`.
#[derive(Debug, Deserialize)]
pub struct DeleteFilesReq {
    pub file_ids: Vec<i64>,
}

/// `POST /containers/{container_id}/files`: upload, or resume with `x-file-id`.
///
/// A failed upload that got as far as creating its file answers with that
/// id in `x-file-id`, so the client can resume it.
pub async fn upload_file(
    State(engine): State<StorageEngine>,
    Path(container_id): Path<i64>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadReceipt>, AppError> {
    let owner_id = required_id(&headers, &USER_ID)?;
    let account_id = required_id(&headers, &ACCOUNT_ID)?;
    let display_name = header_str(&headers, &FILE_NAME)
        .ok_or_else(|| AppError::bad_request("missing x-file-name header"))?
        .to_string();
    let resume_file_id = optional_id(&headers, &FILE_ID)?;
    let mime_type = header_str(&headers, &header::CONTENT_TYPE)
        .unwrap_or("application/octet-stream")
        .to_string();

    let stream = body.into_data_stream().map_err(io::Error::other);

    let receipt = engine
        .uploads()
        .upload(
            UploadRequest {
                container_id,
                owner_id,
                account_id,
                display_name,
                mime_type,
                resume_file_id,
            },
            stream,
        )
        .await
        .map_err(|failure| {
            let err = AppError::from(failure.error);
            match failure.file_id {
                Some(file_id) => err.with_header(FILE_ID, &file_id.to_string()),
                None => err,
            }
        })?;
    Ok(Json(receipt))
}

/// `GET /containers/{container_id}/files/{file_id}/resume`
pub async fn resume_status(
    State(engine): State<StorageEngine>,
    Path((container_id, file_id)): Path<(i64, i64)>,
) -> Result<Json<ResumeStatus>, AppError> {
    let status = engine.files().resume_status(file_id, container_id).await?;
    Ok(Json(status))
}

/// `GET /containers/{container_id}/files/{file_id}`: full or ranged download.
pub async fn download_file(
    State(engine): State<StorageEngine>,
    Path((container_id, file_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let start_byte = header_str(&headers, &header::RANGE).and_then(parse_range_start);

    let download = engine
        .downloads()
        .open(DownloadRequest {
            file_id,
            container_id,
            start_byte,
        })
        .await?;
    Ok(download_response(download))
}

/// `DELETE /containers/{container_id}/files`
pub async fn delete_files(
    State(engine): State<StorageEngine>,
    Path(container_id): Path<i64>,
    Json(payload): Json<DeleteFilesReq>,
) -> Result<Json<DeleteSummary>, AppError> {
    let summary = engine
        .files()
        .delete_files(container_id, &payload.file_ids)
        .await?;
    Ok(Json(summary))
}

fn download_response(download: Download) -> Response {
    let Download {
        file,
        range,
        content_length,
        body,
    } = download;

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let disposition = format!("attachment; filename=\"{}\"", file.display_name.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    match range {
        Some(range) => {
            if let Ok(value) = HeaderValue::from_str(&range.to_string()) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        }
        None => *response.status_mut() = StatusCode::OK,
    }
    response
}

/// Start byte of a `bytes=<start>-[<end>]` range. Anything else, including
/// suffix and multi-part ranges, yields `None`.
fn parse_range_start(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim();
    if !end.is_empty() && end.parse::<u64>().ok()? < start {
        return None;
    }
    Some(start)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn optional_id(headers: &HeaderMap, name: &HeaderName) -> Result<Option<i64>, AppError> {
    header_str(headers, name)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| AppError::bad_request(format!("invalid {name} header `{raw}`")))
        })
        .transpose()
}

fn required_id(headers: &HeaderMap, name: &HeaderName) -> Result<i64, AppError> {
    optional_id(headers, name)?.ok_or_else(|| AppError::bad_request(format!("missing {name} header")))
}
