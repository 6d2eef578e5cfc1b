//! Dump import endpoints: run an import, poll its progress, list skipped
//! records and request cancellation.

use crate::error::ApiError;
use crate::import::validation::is_valid_identifier;
use crate::import::{
    EntityKind, ImportJob, ImportResult, ImportServices, ProgressSnapshot, SharedImportStore,
    SkippedRecord, new_job_id,
};
use crate::models::MessageResponse;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

fn resolve_progress_id(progress_id: Option<String>) -> Result<String, ApiError> {
    match progress_id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
        Some(id) if id.len() <= 100 && is_valid_identifier(&id) => Ok(id),
        Some(id) => Err(ApiError::BadRequest(format!(
            "Invalid progress id '{id}': use letters, digits, '_' or '-'"
        ))),
        None => Ok(new_job_id()),
    }
}

/// Import a raw SQL dump and return per-entity results once it completes.
///
/// Pass `progress_id` to poll progress while the import runs; one is
/// generated otherwise.
#[openapi(tag = "Imports")]
#[post("/imports?<progress_id>", data = "<dump>")]
pub async fn start_import(
    progress_id: Option<String>,
    dump: Vec<u8>,
    store: &State<SharedImportStore>,
    services: &State<ImportServices>,
) -> Result<Json<ImportResult>, ApiError> {
    let job_id = resolve_progress_id(progress_id)?;

    let result = ImportJob::new(job_id, store.inner().as_ref(), services.inner())
        .run(&dump)
        .await?;

    Ok(Json(result))
}

/// Current progress of an import. Unknown ids report "not started".
#[openapi(tag = "Imports")]
#[get("/imports/<progress_id>/progress")]
pub fn get_progress(
    progress_id: String,
    services: &State<ImportServices>,
) -> Json<ProgressSnapshot> {
    Json(services.progress.get(&progress_id))
}

/// Every retained skipped record of one entity type.
#[openapi(tag = "Imports")]
#[get("/imports/<progress_id>/skipped/<entity>")]
pub fn get_skipped(
    progress_id: String,
    entity: String,
    services: &State<ImportServices>,
) -> Result<Json<Vec<SkippedRecord>>, ApiError> {
    let entity: EntityKind = entity.parse().map_err(ApiError::BadRequest)?;
    Ok(Json(services.errors.get(&progress_id, entity)))
}

/// Ask a running import to stop before its next chunk.
#[openapi(tag = "Imports")]
#[post("/imports/<progress_id>/cancel")]
pub fn cancel_import(
    progress_id: String,
    services: &State<ImportServices>,
) -> Result<Json<MessageResponse>, ApiError> {
    if services.registry.cancel(&progress_id) {
        log::info!("job {}: cancellation requested", progress_id);
        Ok(Json(MessageResponse::new(format!(
            "Cancellation requested for import {progress_id}"
        ))))
    } else {
        Err(ApiError::NotFound(format!(
            "Import '{progress_id}' is not running"
        )))
    }
}
