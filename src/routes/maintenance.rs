use crate::{auth::MaintenanceToken, config::Config, errors::ApiError, uploads::UploadManager};
use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReq {
    pub older_than_days: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResp {
    pub removed: u64,
    pub older_than_days: u32,
}

/// Retention sweep, driven by an external scheduler.
pub async fn cleanup(
    cfg: web::Data<Config>,
    uploads: web::Data<UploadManager>,
    _token: MaintenanceToken,
    body: Option<web::Json<CleanupReq>>,
) -> Result<HttpResponse, ApiError> {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    let days = body.older_than_days.unwrap_or(cfg.cleanup_default_days);
    let removed = uploads.cleanup_older_than(days).await?;
    log::info!("MaintenanceAction: cleanup older_than_days={} removed={}", days, removed);
    Ok(HttpResponse::Ok().json(CleanupResp {
        removed,
        older_than_days: days,
    }))
}
