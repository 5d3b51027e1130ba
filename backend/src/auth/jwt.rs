use super::models::{AuthUser, Claims};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
    #[error("JWT decoding error: {0}")]
    Decoding(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl JwtService {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn generate_token(&self, user: &AuthUser) -> Result<String, JwtError> {
        let now = Utc::now();
        let expiration = now + self.ttl;

        let claims = Claims {
            sub: user.id.clone(),
            role: user.role,
            exp: expiration.timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        let header = Header::new(Algorithm::HS256);
        encode(&header, &claims, &self.encoding_key).map_err(JwtError::Encoding)
    }

    pub fn verify_token(&self, token: &str) -> Result<AuthUser, JwtError> {
        if token.is_empty() || token.split('.').count() != 3 {
            return Err(JwtError::InvalidToken);
        }

        let validation = Validation::new(Algorithm::HS256);

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(token_data) => {
                let now = Utc::now().timestamp() as usize;
                log::debug!(
                    "JWT token decoded. User: {}, Role: {}, Exp: {}, Now: {}",
                    token_data.claims.sub,
                    token_data.claims.role,
                    token_data.claims.exp,
                    now
                );

                if token_data.claims.exp < now {
                    return Err(JwtError::TokenExpired);
                }
                Ok(AuthUser {
                    id: token_data.claims.sub,
                    role: token_data.claims.role,
                })
            }
            Err(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(JwtError::TokenExpired),
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => Err(JwtError::InvalidToken),
                _ => Err(JwtError::Decoding(err.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Role;

    fn admin() -> AuthUser {
        AuthUser {
            id: "admin".into(),
            role: Role::Admin,
        }
    }

    #[test]
    fn issued_tokens_verify_to_the_same_user() {
        let service = JwtService::new("secret", 24);
        let token = service.generate_token(&admin()).unwrap();
        assert_eq!(service.verify_token(&token).unwrap(), admin());
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let token = JwtService::new("one", 24).generate_token(&admin()).unwrap();
        let err = JwtService::new("two", 24).verify_token(&token).unwrap_err();
        assert!(matches!(err, JwtError::InvalidToken));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let service = JwtService::new("secret", -2);
        let token = service.generate_token(&admin()).unwrap();
        assert!(matches!(
            service.verify_token(&token),
            Err(JwtError::TokenExpired)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let service = JwtService::new("secret", 24);
        assert!(matches!(service.verify_token(""), Err(JwtError::InvalidToken)));
        assert!(matches!(service.verify_token("abc"), Err(JwtError::InvalidToken)));
    }
}
