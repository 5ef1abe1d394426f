mod config;
mod errors;
mod db;
mod auth;
mod models;
mod routes;
mod permissions;
mod uploads;

use actix_cors::Cors;
use actix_web::{App, HttpServer};
use crate::config::Config;
use crate::db::Db;
use crate::uploads::{UploadManager, UploadPolicy};
use actix_web::middleware::Logger;
use actix_web::http::header;
use actix_web::web::Data;
use env_logger::Env;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Init logger to show info by default, but can be overridden by RUST_LOG
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cfg = Config::from_args_env()?;

    let db = Db::connect_and_migrate(&cfg.database_path).await?;
    let uploads = UploadManager::new(db, UploadPolicy::from(&cfg));
    log::info!("Starting upload tracker at {}", cfg.listen);

    let listen_addr = cfg.listen.clone();
    HttpServer::new(move || {
        let cors = cfg
            .allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST", "PATCH"])
            .allowed_headers(vec![header::AUTHORIZATION, header::ACCEPT, header::CONTENT_TYPE])
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(Data::new(cfg.clone()))
            .app_data(Data::new(uploads.clone()))
            .configure(routes::configure)
    })
    .bind(listen_addr)?
    .run()
    .await?;
    Ok(())
}
