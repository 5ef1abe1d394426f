use crate::{
    auth::AuthUser,
    errors::ApiError,
    models::upload::{UploadSession, UploadStatus},
    permissions::require_owner,
    uploads::{NewChunk, NewUpload, UploadManager},
};
use actix_web::{HttpResponse, web};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadReq {
    pub filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub total_chunks: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReq {
    pub uploaded_bytes: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReq {
    pub chunk_index: i64,
    pub chunk_size: i64,
    pub checksum: Option<String>,
    pub locator: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyChunkReq {
    pub checksum: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteReq {
    pub result_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailReq {
    pub error_message: String,
}

/// Loads the session and checks the caller owns it.
async fn owned(uploads: &UploadManager, id: &str, user: &AuthUser) -> Result<UploadSession, ApiError> {
    let session = uploads.get(id).await?;
    require_owner(&session, &user.user_id)?;
    Ok(session)
}

pub async fn create_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    body: web::Json<CreateUploadReq>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let session = uploads
        .initiate(
            &user.user_id,
            NewUpload {
                filename: body.filename,
                file_size: body.file_size,
                mime_type: body.mime_type,
                total_chunks: body.total_chunks,
            },
        )
        .await?;
    Ok(HttpResponse::Created().json(session))
}

pub async fn list_uploads(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    q: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(str::parse::<UploadStatus>)
        .transpose()?;
    let list = uploads.list_for_owner(&user.user_id, status).await?;
    Ok(HttpResponse::Ok().json(list))
}

pub async fn get_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let session = owned(&uploads, &path.into_inner(), &user).await?;
    Ok(HttpResponse::Ok().json(session))
}

pub async fn record_progress(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
    body: web::Json<ProgressReq>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    let session = uploads.record_progress(&id, body.uploaded_bytes).await?;
    Ok(HttpResponse::Ok().json(session))
}

pub async fn get_progress(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    Ok(HttpResponse::Ok().json(uploads.get_progress(&id).await?))
}

pub async fn record_chunk(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
    body: web::Json<ChunkReq>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    let body = body.into_inner();
    let receipt = uploads
        .record_chunk(
            &id,
            NewChunk {
                chunk_index: body.chunk_index,
                chunk_size: body.chunk_size,
                checksum: body.checksum,
                locator: body.locator,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(receipt))
}

pub async fn list_chunks(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let session = owned(&uploads, &path.into_inner(), &user).await?;
    let manifest = uploads.chunk_manifest(&session).await?;
    let chunks = uploads.list_chunks(&session.id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "manifest": manifest,
        "chunks": chunks,
    })))
}

pub async fn verify_chunk(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<(String, i64)>,
    body: web::Json<VerifyChunkReq>,
) -> Result<HttpResponse, ApiError> {
    let (id, chunk_index) = path.into_inner();
    owned(&uploads, &id, &user).await?;
    let chunk = uploads.verify_chunk(&id, chunk_index, &body.checksum).await?;
    Ok(HttpResponse::Ok().json(chunk))
}

pub async fn complete_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
    body: web::Json<CompleteReq>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    let session = uploads.complete_chunked_upload(&id, &body.result_url).await?;
    Ok(HttpResponse::Ok().json(session))
}

pub async fn fail_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
    body: web::Json<FailReq>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    let session = uploads.fail(&id, &body.error_message).await?;
    Ok(HttpResponse::Ok().json(session))
}

pub async fn retry_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    Ok(HttpResponse::Ok().json(uploads.retry(&id).await?))
}

pub async fn pause_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    Ok(HttpResponse::Ok().json(uploads.pause(&id).await?))
}

pub async fn resume_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    Ok(HttpResponse::Ok().json(uploads.resume(&id).await?))
}

pub async fn cancel_upload(
    uploads: web::Data<UploadManager>,
    user: AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    owned(&uploads, &id, &user).await?;
    Ok(HttpResponse::Ok().json(uploads.cancel(&id).await?))
}

#[cfg(test)]
mod tests {
    use crate::{auth, config::Config, db::Db, routes, uploads::UploadManager};
    use actix_web::{App, http::StatusCode, test, web};
    use serde_json::{Value, json};

    fn cfg() -> Config {
        Config {
            jwt_secret: Some("test-secret".into()),
            public_base_url: "https://files.test".into(),
            maintenance_token: Some("sweep".into()),
            ..Config::default()
        }
    }

    fn bearer(user_id: &str, cfg: &Config) -> (&'static str, String) {
        let token = auth::create_access_token(user_id, cfg).unwrap();
        ("Authorization", format!("Bearer {token}"))
    }

    macro_rules! app {
        ($cfg:expr) => {{
            let db = Db::connect_in_memory().await.unwrap();
            let uploads = UploadManager::new(db, (&$cfg).into());
            test::init_service(
                App::new()
                    .app_data(web::Data::new($cfg.clone()))
                    .app_data(web::Data::new(uploads))
                    .configure(routes::configure),
            )
            .await
        }};
    }

    #[actix_web::test]
    async fn chunked_upload_over_http() {
        let cfg = cfg();
        let app = app!(cfg);
        let auth = bearer("u1", &cfg);

        let req = test::TestRequest::post()
            .uri("/api/uploads")
            .insert_header(auth.clone())
            .set_json(json!({
                "filename": "a.zip",
                "fileSize": 1000,
                "mimeType": "application/zip",
                "totalChunks": 4
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let session: Value = test::read_body_json(resp).await;
        assert_eq!(session["status"], "pending");
        let id = session["id"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for i in 0..4 {
            let req = test::TestRequest::post()
                .uri(&format!("/api/uploads/{id}/chunks"))
                .insert_header(auth.clone())
                .set_json(json!({ "chunkIndex": i, "chunkSize": 250, "checksum": format!("c{i}") }))
                .to_request();
            last = test::call_and_read_body_json(&app, req).await;
        }
        assert_eq!(last["session"]["status"], "completed");
        assert_eq!(last["session"]["chunksUploaded"], 4);

        let req = test::TestRequest::get()
            .uri(&format!("/api/uploads/{id}/progress"))
            .insert_header(auth.clone())
            .to_request();
        let snap: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(snap["progressPercent"], 100.0);
        assert_eq!(snap["status"], "completed");

        let req = test::TestRequest::post()
            .uri(&format!("/api/uploads/{id}/complete"))
            .insert_header(auth)
            .set_json(json!({ "resultUrl": "https://cdn.test/a.zip" }))
            .to_request();
        let done: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(done["resultUrl"], "https://cdn.test/a.zip");
    }

    #[actix_web::test]
    async fn progress_fail_and_retry_over_http() {
        let cfg = cfg();
        let app = app!(cfg);
        let auth = bearer("u1", &cfg);

        let req = test::TestRequest::post()
            .uri("/api/uploads")
            .insert_header(auth.clone())
            .set_json(json!({ "filename": "b.pdf", "fileSize": 1000, "mimeType": "application/pdf" }))
            .to_request();
        let session: Value = test::call_and_read_body_json(&app, req).await;
        let id = session["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::patch()
            .uri(&format!("/api/uploads/{id}/progress"))
            .insert_header(auth.clone())
            .set_json(json!({ "uploadedBytes": 500 }))
            .to_request();
        let half: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(half["status"], "uploading");
        assert_eq!(half["progress"], 50.0);

        let req = test::TestRequest::patch()
            .uri(&format!("/api/uploads/{id}/progress"))
            .insert_header(auth.clone())
            .set_json(json!({ "uploadedBytes": 100 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri(&format!("/api/uploads/{id}/fail"))
            .insert_header(auth.clone())
            .set_json(json!({ "errorMessage": "network timeout" }))
            .to_request();
        let failed: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["errorMessage"], "network timeout");

        let req = test::TestRequest::post()
            .uri(&format!("/api/uploads/{id}/resume"))
            .insert_header(auth.clone())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().starts_with("invalid state"));

        let req = test::TestRequest::post()
            .uri(&format!("/api/uploads/{id}/retry"))
            .insert_header(auth)
            .to_request();
        let retried: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(retried["status"], "pending");
        assert_eq!(retried["uploadedBytes"], 0);
        assert_eq!(retried["retryCount"], 1);
    }

    #[actix_web::test]
    async fn uploads_are_private_to_their_owner() {
        let cfg = cfg();
        let app = app!(cfg);

        let req = test::TestRequest::post()
            .uri("/api/uploads")
            .insert_header(bearer("u1", &cfg))
            .set_json(json!({ "filename": "a.zip", "fileSize": 10, "mimeType": "application/zip" }))
            .to_request();
        let session: Value = test::call_and_read_body_json(&app, req).await;
        let id = session["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri(&format!("/api/uploads/{id}/cancel"))
            .insert_header(bearer("u2", &cfg))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri("/api/uploads")
            .insert_header(bearer("u2", &cfg))
            .to_request();
        let list: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(list.as_array().unwrap().len(), 0);

        let req = test::TestRequest::get().uri(&format!("/api/uploads/{id}")).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn manifest_reports_missing_chunks() {
        let cfg = cfg();
        let app = app!(cfg);
        let auth = bearer("u1", &cfg);

        let req = test::TestRequest::post()
            .uri("/api/uploads")
            .insert_header(auth.clone())
            .set_json(json!({ "filename": "v.mp4", "fileSize": 300, "mimeType": "video/mp4", "totalChunks": 3 }))
            .to_request();
        let session: Value = test::call_and_read_body_json(&app, req).await;
        let id = session["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri(&format!("/api/uploads/{id}/chunks"))
            .insert_header(auth.clone())
            .set_json(json!({ "chunkIndex": 1, "chunkSize": 100, "checksum": "x1" }))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/uploads/{id}/chunks"))
            .insert_header(auth.clone())
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["manifest"]["totalChunks"], 3);
        assert_eq!(body["manifest"]["missing"], json!([0, 2]));
        assert_eq!(body["chunks"][0]["chunkIndex"], 1);
        assert_eq!(body["chunks"][0]["checksum"], "x1");

        let req = test::TestRequest::post()
            .uri(&format!("/api/uploads/{id}/chunks/1/verify"))
            .insert_header(auth.clone())
            .set_json(json!({ "checksum": "x1" }))
            .to_request();
        let chunk: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(chunk["status"], "verified");

        let req = test::TestRequest::get()
            .uri("/api/uploads?status=bogus")
            .insert_header(auth)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn json_fields_are_camel_case() {
        let cfg = cfg();
        let app = app!(cfg);

        let req = test::TestRequest::post()
            .uri("/api/uploads")
            .insert_header(bearer("u1", &cfg))
            .set_json(json!({ "filename": "a.zip", "file_size": 10, "mime_type": "application/zip" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/uploads")
            .insert_header(bearer("u1", &cfg))
            .set_json(json!({ "filename": "a.zip", "fileSize": 10, "mimeType": "application/zip" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let session: Value = test::read_body_json(resp).await;
        assert_eq!(session["userId"], "u1");
        assert_eq!(session["fileSize"], 10);
        assert!(session.get("file_size").is_none());
    }
}
