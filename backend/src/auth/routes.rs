use actix_web::{HttpResponse, web};
use shared::{LoginRequest, LoginResponse, ResetResponse, UserInfo};

use super::jwt::JwtService;
use super::middleware::AuthenticatedUser;
use super::users::UserDirectory;
use crate::error::ApiError;
use crate::storage::Workspaces;

/// Checks credentials, issues a token and starts a fresh workspace.
pub async fn login(
    body: web::Json<LoginRequest>,
    users: web::Data<UserDirectory>,
    jwt_service: web::Data<JwtService>,
    workspaces: web::Data<Workspaces>,
) -> Result<HttpResponse, ApiError> {
    let request = body.into_inner();
    let Some(user) = users.verify(&request.username, &request.password) else {
        log::warn!("Failed login for {}", request.username);
        return Err(ApiError::unauthorized("invalid username or password"));
    };

    let token = jwt_service.generate_token(&user)?;
    let summary = workspaces.for_user(&user.id).reset().await;
    log::info!(
        "User {} logged in as {}; cleared {} staged file(s)",
        user.id,
        user.role,
        summary.removed
    );

    Ok(HttpResponse::Ok().json(LoginResponse {
        token,
        user: user.into(),
    }))
}

pub async fn logout(
    user: AuthenticatedUser,
    workspaces: web::Data<Workspaces>,
) -> Result<HttpResponse, ApiError> {
    let summary = workspaces.for_user(&user.0.id).reset().await;
    log::info!("User {} logged out", user.0.id);
    Ok(HttpResponse::Ok().json(ResetResponse {
        removed: summary.removed,
        failed: summary.failed,
    }))
}

pub async fn me(user: AuthenticatedUser) -> Result<HttpResponse, ApiError> {
    log::debug!("/auth/me endpoint called for user: {}", user.0.id);
    Ok(HttpResponse::Ok().json(UserInfo::from(user.0)))
}
