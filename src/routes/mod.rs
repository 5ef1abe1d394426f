pub mod health;
pub mod maintenance;
pub mod uploads;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/uploads")
                    .route("", web::get().to(uploads::list_uploads))
                    .route("", web::post().to(uploads::create_upload))
                    .route("/{id}", web::get().to(uploads::get_upload))
                    .route("/{id}/progress", web::get().to(uploads::get_progress))
                    .route("/{id}/progress", web::patch().to(uploads::record_progress))
                    .route("/{id}/chunks", web::get().to(uploads::list_chunks))
                    .route("/{id}/chunks", web::post().to(uploads::record_chunk))
                    .route("/{id}/chunks/{index}/verify", web::post().to(uploads::verify_chunk))
                    .route("/{id}/complete", web::post().to(uploads::complete_upload))
                    .route("/{id}/fail", web::post().to(uploads::fail_upload))
                    .route("/{id}/retry", web::post().to(uploads::retry_upload))
                    .route("/{id}/pause", web::post().to(uploads::pause_upload))
                    .route("/{id}/resume", web::post().to(uploads::resume_upload))
                    .route("/{id}/cancel", web::post().to(uploads::cancel_upload)),
            )
            .service(
                web::scope("/maintenance")
                    .route("/cleanup", web::post().to(maintenance::cleanup)),
            ),
    );
}
