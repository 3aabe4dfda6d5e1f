use std::{path::Path, sync::Arc};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    routing::post,
};
use serde::Serialize;
use tracing::info;

use crate::{AppState, error::RagError, pipeline::DocumentKind};

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Serialize)]
struct UploadResponse {
    status: String,
    message: String,
    chunk_count: usize,
}

pub fn document_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/upload-pdf", post(upload_pdf))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

async fn upload_pdf(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, RagError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| RagError::InvalidInput(format!("invalid multipart payload: {err}")))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().map(|name| name.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|err| RagError::InvalidInput(format!("failed to read upload field: {err}")))?;
            file_bytes = Some(data.to_vec());
            break;
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| {
        RagError::InvalidInput("missing file field in multipart payload".to_string())
    })?;
    let filename = filename
        .ok_or_else(|| RagError::InvalidInput("uploaded file missing filename".to_string()))?;

    let is_pdf = Path::new(&filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if !is_pdf {
        return Err(RagError::UnsupportedFormat(format!(
            "only PDF uploads are accepted, got `{filename}`"
        )));
    }

    let report = state
        .pipeline
        .ingest(&file_bytes, DocumentKind::Pdf, &filename)
        .await?;

    info!(filename = %filename, chunk_count = report.chunk_count, "file processed");

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        message: format!("File '{filename}' processed."),
        chunk_count: report.chunk_count,
    }))
}
