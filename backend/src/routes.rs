use actix_files::{Files, NamedFile};
use actix_multipart::{Field, Multipart};
use actix_web::{HttpRequest, HttpResponse, web};
use futures::{StreamExt, TryStreamExt};
use log::{info, warn};
use shared::{
    ActivateRequest, DetectRequest, ErrorBody, ErrorKind, HealthResponse, ModelsResponse,
    RejectedUpload, ResetResponse, Role, UploadResponse,
};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthenticatedUser;
use crate::auth::routes as auth_routes;
use crate::error::ApiError;
use crate::inference::{DetectionRunner, ModelRegistry};
use crate::state::UploadLimits;
use crate::storage::{ArtifactStore, WorkspaceError, Workspaces};

const IMAGE_FIELDS: [&str; 2] = ["files", "files[]"];
const MODEL_FIELD: &str = "model";

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: Option<PathBuf>) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(
            web::scope("/auth")
                .route("/login", web::post().to(auth_routes::login))
                .route("/logout", web::post().to(auth_routes::logout))
                .route("/me", web::get().to(auth_routes::me)),
        )
        .service(
            web::scope("/api")
                .service(
                    web::resource("/uploads")
                        .route(web::post().to(upload_images))
                        .route(web::get().to(list_uploads))
                        .route(web::delete().to(reset_uploads)),
                )
                .route("/detect", web::post().to(detect_one))
                .route("/detect/all", web::post().to(detect_all))
                .service(
                    web::resource("/models")
                        .route(web::get().to(list_models))
                        .route(web::post().to(upload_model)),
                )
                .route("/models/active", web::post().to(activate_model)),
        )
        .route("/uploads/{name}", web::get().to(serve_upload))
        .route("/results/{tail:.*}", web::get().to(serve_result));

    if let Some(dir) = static_dir {
        cfg.service(Files::new("/static", dir).index_file("index.html"));
    }
}

async fn health(registry: web::Data<ModelRegistry>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        active_model: registry.current().map(|model| model.id.clone()),
    })
}

/// Reads a multipart field into memory. `None` means the field exceeded
/// `limit`; the rest of it is drained so the next field can be read.
async fn read_field(field: &mut Field, limit: usize) -> Result<Option<Vec<u8>>, ApiError> {
    let mut data = Vec::new();
    let mut oversized = false;
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if oversized {
            continue;
        }
        if data.len() + chunk.len() > limit {
            oversized = true;
            data = Vec::new();
            continue;
        }
        data.extend_from_slice(&chunk);
    }
    Ok((!oversized).then_some(data))
}

fn field_file_name(field: &Field) -> Option<String> {
    field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .map(str::to_string)
}

fn field_name(field: &Field) -> String {
    field.name().unwrap_or_default().to_string()
}

fn too_large(original_name: String, limit: usize) -> RejectedUpload {
    RejectedUpload {
        original_name,
        error: ErrorBody::new(
            ErrorKind::PayloadTooLarge,
            format!("file exceeds the {limit} byte limit"),
        ),
    }
}

async fn upload_images(
    user: AuthenticatedUser,
    mut payload: Multipart,
    workspaces: web::Data<Workspaces>,
    limits: web::Data<UploadLimits>,
) -> Result<HttpResponse, ApiError> {
    let workspace = workspaces.for_user(&user.0.id);
    let mut response = UploadResponse {
        stored: Vec::new(),
        rejected: Vec::new(),
    };

    while let Some(mut field) = payload.try_next().await? {
        let name = field_name(&field);
        if !IMAGE_FIELDS.contains(&name.as_str()) {
            read_field(&mut field, 0).await?;
            continue;
        }
        let Some(original_name) = field_file_name(&field).filter(|n| !n.is_empty()) else {
            read_field(&mut field, 0).await?;
            continue;
        };

        let Some(bytes) = read_field(&mut field, limits.image_bytes).await? else {
            warn!("Rejected oversized upload {} from {}", original_name, user.0.id);
            response.rejected.push(too_large(original_name, limits.image_bytes));
            continue;
        };

        match workspace.store(&original_name, &bytes).await {
            Ok(image) => response.stored.push(image),
            Err(err @ WorkspaceError::InvalidExtension(_)) => {
                response.rejected.push(RejectedUpload {
                    original_name,
                    error: ErrorBody::new(err.kind(), err.to_string()),
                });
            }
            Err(err) => return Err(err.into()),
        }
    }

    if response.stored.is_empty() && response.rejected.is_empty() {
        return Err(ApiError::bad_request("no files in request"));
    }
    info!(
        "User {} uploaded {} file(s), {} rejected",
        user.0.id,
        response.stored.len(),
        response.rejected.len()
    );
    Ok(HttpResponse::Ok().json(response))
}

async fn list_uploads(
    user: AuthenticatedUser,
    workspaces: web::Data<Workspaces>,
) -> Result<HttpResponse, ApiError> {
    let images = workspaces.for_user(&user.0.id).list().await?;
    Ok(HttpResponse::Ok().json(images))
}

async fn reset_uploads(
    user: AuthenticatedUser,
    workspaces: web::Data<Workspaces>,
) -> Result<HttpResponse, ApiError> {
    let summary = workspaces.for_user(&user.0.id).reset().await;
    Ok(HttpResponse::Ok().json(ResetResponse {
        removed: summary.removed,
        failed: summary.failed,
    }))
}

async fn open_file(req: &HttpRequest, path: &Path) -> Result<HttpResponse, ApiError> {
    let file = NamedFile::open_async(path).await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ApiError::new(ErrorKind::NotFound, "file disappeared")
        } else {
            ApiError::internal(err.to_string())
        }
    })?;
    Ok(file.into_response(req))
}

async fn serve_upload(
    req: HttpRequest,
    user: AuthenticatedUser,
    name: web::Path<String>,
    workspaces: web::Data<Workspaces>,
) -> Result<HttpResponse, ApiError> {
    let path = workspaces.for_user(&user.0.id).resolve(&name).await?;
    open_file(&req, &path).await
}

async fn serve_result(
    req: HttpRequest,
    _user: AuthenticatedUser,
    tail: web::Path<String>,
    artifacts: web::Data<ArtifactStore>,
) -> Result<HttpResponse, ApiError> {
    let path = artifacts.resolve_for_serving(&tail).await?;
    open_file(&req, &path).await
}

async fn detect_one(
    user: AuthenticatedUser,
    body: web::Json<DetectRequest>,
    workspaces: web::Data<Workspaces>,
    runner: web::Data<DetectionRunner>,
) -> Result<HttpResponse, ApiError> {
    let workspace = workspaces.for_user(&user.0.id);
    let artifact = runner.run_one(&workspace, &body.filename).await?;
    Ok(HttpResponse::Ok().json(artifact.to_item()))
}

async fn detect_all(
    user: AuthenticatedUser,
    workspaces: web::Data<Workspaces>,
    runner: web::Data<DetectionRunner>,
) -> Result<HttpResponse, ApiError> {
    let workspace = workspaces.for_user(&user.0.id);
    let runner = runner.into_inner();
    let cancel = CancellationToken::new();
    // Dropping this request (client went away) cancels the batch.
    let guard = cancel.clone().drop_guard();

    let batch = actix_web::rt::spawn(async move { runner.run_all(&workspace, &cancel).await });
    let report = batch
        .await
        .map_err(|err| ApiError::internal(format!("batch task failed: {err}")))??;
    guard.disarm();

    Ok(HttpResponse::Ok().json(report.to_response()))
}

async fn list_models(
    user: AuthenticatedUser,
    registry: web::Data<ModelRegistry>,
) -> Result<HttpResponse, ApiError> {
    user.require_role(Role::Admin)?;
    Ok(HttpResponse::Ok().json(ModelsResponse {
        models: registry.list_available().await?,
        active: registry.current().map(|model| model.info()),
    }))
}

/// Installs the uploaded model and then activates it. A failed activation
/// leaves the installed file in place and the previous model active.
async fn upload_model(
    user: AuthenticatedUser,
    mut payload: Multipart,
    registry: web::Data<ModelRegistry>,
    limits: web::Data<UploadLimits>,
) -> Result<HttpResponse, ApiError> {
    user.require_role(Role::Admin)?;

    let mut installed = None;
    while let Some(mut field) = payload.try_next().await? {
        let file_name = match field_file_name(&field) {
            Some(name) if installed.is_none() && field_name(&field) == MODEL_FIELD => name,
            _ => {
                read_field(&mut field, 0).await?;
                continue;
            }
        };
        let Some(bytes) = read_field(&mut field, limits.model_bytes).await? else {
            return Err(ApiError::new(
                ErrorKind::PayloadTooLarge,
                format!("model exceeds the {} byte limit", limits.model_bytes),
            ));
        };
        installed = Some(registry.install(&file_name, &bytes).await?);
    }

    let Some(model_id) = installed else {
        return Err(ApiError::bad_request("no model file in request"));
    };
    info!("Admin {} uploaded model {}", user.0.id, model_id);
    let model = registry.activate(&model_id).await?;
    Ok(HttpResponse::Ok().json(model.info()))
}

async fn activate_model(
    user: AuthenticatedUser,
    body: web::Json<ActivateRequest>,
    registry: web::Data<ModelRegistry>,
) -> Result<HttpResponse, ApiError> {
    user.require_role(Role::Admin)?;
    let model = registry.activate(&body.model).await?;
    info!("Admin {} activated model {}", user.0.id, model.id);
    Ok(HttpResponse::Ok().json(model.info()))
}
