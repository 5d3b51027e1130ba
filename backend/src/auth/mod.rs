pub mod jwt;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod users;

pub use jwt::JwtService;
pub use middleware::{AuthMiddleware, AuthenticatedUser};
pub use users::UserDirectory;
