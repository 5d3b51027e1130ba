mod auth;
mod config;
mod error;
mod inference;
mod routes;
mod state;
mod storage;

use actix_cors::Cors;
use actix_web::{App, HttpServer};
use auth::AuthMiddleware;
use config::AppConfig;
use inference::CommandBackend;
use routes::configure_routes;
use state::AppState;
use std::io;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Failed to load configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;

    for dir in [
        &config.storage.uploads_dir,
        &config.storage.results_dir,
        &config.storage.models_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let backend = CommandBackend::new(
        config.inference.program.clone(),
        config.inference.args.clone(),
    );
    let state = AppState::new(&config, Arc::new(backend));

    if let Some(default_model) = &config.storage.default_model {
        if let Err(e) = state.registry.seed_default(default_model).await {
            log::error!("Failed to seed default model {}: {}", default_model.display(), e);
        }
    }
    match state.registry.recover().await {
        Some(model) => log::info!("Serving with model {} (sha256 {})", model.id, model.digest),
        None => log::warn!("Starting without an active model; detection requests will fail"),
    }

    log::info!(
        "Uploads under {}, results under {}",
        config.storage.uploads_dir.display(),
        state.artifacts.root().display()
    );

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("Starting server on {}", bind_address);
    if let Some(dir) = &state.static_dir {
        log::info!("Serving static files from {}", dir.display());
    }

    HttpServer::new(move || {
        let state = state.clone();
        let auth_middleware = AuthMiddleware::new(state.jwt_service.clone());
        App::new()
            .wrap(auth_middleware)
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .configure(|cfg| {
                state.register(cfg);
                configure_routes(cfg, state.static_dir.clone());
            })
    })
    .bind(&bind_address)?
    .run()
    .await
}
