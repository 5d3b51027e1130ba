use actix_web::web;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::{JwtService, UserDirectory};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::inference::{DetectionRunner, ModelLoader, ModelRegistry};
use crate::storage::{ArtifactStore, Workspaces};

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub image_bytes: usize,
    pub model_bytes: usize,
}

/// Long-lived services shared by every worker.
#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<Workspaces>,
    pub artifacts: Arc<ArtifactStore>,
    pub registry: Arc<ModelRegistry>,
    pub runner: Arc<DetectionRunner>,
    pub jwt_service: Arc<JwtService>,
    pub users: Arc<UserDirectory>,
    pub limits: UploadLimits,
    pub static_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(config: &AppConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let artifacts = Arc::new(ArtifactStore::new(&config.storage.results_dir));
        let registry = Arc::new(ModelRegistry::new(
            &config.storage.models_dir,
            &config.storage.model_config,
            config.inference.model_extension.as_str(),
            loader,
        ));
        let runner = Arc::new(DetectionRunner::new(
            registry.clone(),
            artifacts.clone(),
            config.inference.timeout(),
        ));

        Self {
            workspaces: Arc::new(Workspaces::new(&config.storage.uploads_dir)),
            artifacts,
            registry,
            runner,
            jwt_service: Arc::new(JwtService::new(
                &config.auth.jwt_secret,
                config.auth.token_ttl_hours,
            )),
            users: Arc::new(UserDirectory::new(&config.auth.users)),
            limits: UploadLimits {
                image_bytes: config.server.max_upload_bytes,
                model_bytes: config.server.max_model_bytes,
            },
            static_dir: config.static_dir_if_present(),
        }
    }

    pub fn register(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::from(self.workspaces.clone()))
            .app_data(web::Data::from(self.artifacts.clone()))
            .app_data(web::Data::from(self.registry.clone()))
            .app_data(web::Data::from(self.runner.clone()))
            .app_data(web::Data::from(self.jwt_service.clone()))
            .app_data(web::Data::from(self.users.clone()))
            .app_data(web::Data::new(self.limits))
            .app_data(
                web::JsonConfig::default()
                    .error_handler(|err, _req| ApiError::bad_request(err.to_string()).into()),
            );
    }
}
