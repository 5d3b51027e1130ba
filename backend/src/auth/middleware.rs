use super::jwt::JwtService;
use super::models::AuthUser;
use crate::error::ApiError;
use actix_web::http::Method;
use actix_web::http::header::Header;
use actix_web::{
    Error, HttpMessage, ResponseError,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use actix_web::{FromRequest, HttpRequest};
use actix_web_httpauth::headers::authorization::{Authorization, Bearer};
use futures::future::{Ready, ready};
use shared::Role;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const PUBLIC_PATHS: [&str; 2] = ["/health", "/auth/login"];
const PUBLIC_PREFIXES: [&str; 1] = ["/static/"];

#[derive(Clone)]
pub struct AuthMiddleware {
    jwt_service: Arc<JwtService>,
}

impl AuthMiddleware {
    pub fn new(jwt_service: Arc<JwtService>) -> Self {
        Self { jwt_service }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type Transform = AuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService {
            service: Arc::new(service),
            jwt_service: self.jwt_service.clone(),
        }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: Arc<S>,
    jwt_service: Arc<JwtService>,
}

#[derive(Debug)]
enum AuthError {
    MissingToken,
    VerificationFailed(String),
}

impl AuthError {
    fn log_message(&self, path: &str) -> String {
        match self {
            AuthError::MissingToken => format!("No bearer token for path: {}", path),
            AuthError::VerificationFailed(e) => {
                format!("JWT token verification failed for path {}: {}", path, e)
            }
        }
    }

    fn client_error(&self) -> ApiError {
        match self {
            AuthError::MissingToken => ApiError::unauthorized("missing or invalid authorization token"),
            AuthError::VerificationFailed(_) => ApiError::unauthorized("token verification failed"),
        }
    }
}

fn is_public(req: &ServiceRequest) -> bool {
    let path = req.path();
    req.method() == Method::OPTIONS
        || PUBLIC_PATHS.contains(&path)
        || PUBLIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

fn validate_request_token(
    req: &ServiceRequest,
    jwt_service: &JwtService,
) -> Result<AuthUser, AuthError> {
    let bearer = Authorization::<Bearer>::parse(req)
        .map_err(|_| AuthError::MissingToken)?
        .into_scheme();

    log::debug!("Found Bearer token, verifying...");
    jwt_service
        .verify_token(bearer.token())
        .map_err(|e| AuthError::VerificationFailed(e.to_string()))
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let jwt_service = self.jwt_service.clone();

        Box::pin(async move {
            if is_public(&req) {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }
            let path_str = req.path().to_string();
            log::debug!("Auth middleware processing path: {}", &path_str);

            match validate_request_token(&req, &jwt_service) {
                Ok(user) => {
                    req.extensions_mut().insert(user);
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                Err(auth_error) => {
                    log::warn!("{}", auth_error.log_message(&path_str));

                    let (http_req, _payload) = req.into_parts();
                    let response = auth_error
                        .client_error()
                        .error_response()
                        .map_into_right_body();
                    Ok(ServiceResponse::new(http_req, response))
                }
            }
        })
    }
}

/// The caller established by `AuthMiddleware`.
pub struct AuthenticatedUser(pub AuthUser);

impl AuthenticatedUser {
    /// Admins satisfy every role; other users only their own.
    pub fn require_role(&self, role: Role) -> Result<(), ApiError> {
        if self.0.is_admin() || self.0.role == role {
            Ok(())
        } else {
            log::warn!("User {} lacks role {}", self.0.id, role);
            Err(ApiError::forbidden(format!("{} role required", role)))
        }
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        match req.extensions().get::<AuthUser>() {
            Some(user) => ready(Ok(AuthenticatedUser(user.clone()))),
            None => {
                log::warn!("No authenticated user in request extensions for path: {}", req.path());
                ready(Err(ApiError::unauthorized("authentication required")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};

    async fn whoami(user: AuthenticatedUser) -> HttpResponse {
        HttpResponse::Ok().body(user.0.id)
    }

    async fn admin_only(user: AuthenticatedUser) -> Result<HttpResponse, ApiError> {
        user.require_role(Role::Admin)?;
        Ok(HttpResponse::Ok().finish())
    }

    fn jwt() -> Arc<JwtService> {
        Arc::new(JwtService::new("test-secret", 1))
    }

    fn token(jwt: &JwtService, id: &str, role: Role) -> String {
        jwt.generate_token(&AuthUser {
            id: id.into(),
            role,
        })
        .unwrap()
    }

    #[actix_web::test]
    async fn rejects_requests_without_a_token() {
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(jwt()))
                .route("/me", web::get().to(whoami)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/me").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["kind"], "unauthorized");
    }

    #[actix_web::test]
    async fn inserts_the_user_for_valid_tokens() {
        let jwt = jwt();
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(jwt.clone()))
                .route("/me", web::get().to(whoami)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header(("Authorization", format!("Bearer {}", token(&jwt, "alice", Role::User))))
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, "alice");
    }

    #[actix_web::test]
    async fn public_paths_skip_authentication() {
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(jwt()))
                .route("/health", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn role_checks_distinguish_admins() {
        let jwt = jwt();
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(jwt.clone()))
                .route("/admin", web::get().to(admin_only)),
        )
        .await;

        let user = test::TestRequest::get()
            .uri("/admin")
            .insert_header(("Authorization", format!("Bearer {}", token(&jwt, "u", Role::User))))
            .to_request();
        assert_eq!(test::call_service(&app, user).await.status(), StatusCode::FORBIDDEN);

        let admin = test::TestRequest::get()
            .uri("/admin")
            .insert_header(("Authorization", format!("Bearer {}", token(&jwt, "a", Role::Admin))))
            .to_request();
        assert_eq!(test::call_service(&app, admin).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn tampered_tokens_are_rejected() {
        let jwt = jwt();
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(jwt.clone()))
                .route("/me", web::get().to(whoami)),
        )
        .await;

        let forged = token(&JwtService::new("other", 1), "mallory", Role::Admin);
        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header(("Authorization", format!("Bearer {forged}")))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    }
}
