mod config;
mod diagnosis;
mod routes;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use config::ServiceConfig;
use diagnosis::{InferenceService, TorchFusionModel};
use routes::configure_routes;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = match ServiceConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
        }
    };

    let device = config.device.resolve();
    log::info!("Using device {:?}", device);

    let model = match TorchFusionModel::load(&config.model_path, device) {
        Ok(model) => model,
        Err(e) => {
            log::error!("Failed to load model at startup: {}", e);
            return Err(std::io::Error::other(format!("Model loading failed: {}", e)));
        }
    };

    let service = InferenceService::new(Arc::new(model), config.degenerate_audio);
    log::info!(
        "Degenerate audio policy: {:?}, inference timeout: {}s, upload limit: {} bytes",
        config.degenerate_audio,
        config.inference_timeout_secs,
        config.max_upload_bytes
    );

    let bind_address = config.bind_address();
    let cors_max_age = config.cors_max_age;
    let service = web::Data::new(service);
    let config = web::Data::new(config);

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(cors_max_age),
            )
            .app_data(service.clone())
            .app_data(config.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
