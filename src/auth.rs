use crate::config::Config;
use crate::errors::ApiError;
use actix_web::{FromRequest, HttpRequest, dev::Payload, web};
use futures_util::future::{Ready, err, ok, ready};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Access tokens are minted by the account service with the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    pub exp: usize,
}

#[cfg(test)]
pub fn create_access_token(user_id: &str, cfg: &Config) -> Result<String, ApiError> {
    use jsonwebtoken::{EncodingKey, Header};

    let exp = (chrono::Utc::now() + chrono::Duration::minutes(15)).timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret_bytes()),
    )
    .map_err(|_| ApiError::Internal)
}

pub fn verify_access_token(token: &str, cfg: &Config) -> Result<Claims, ApiError> {
    let mut v = Validation::new(Algorithm::HS256);
    v.validate_exp = true;
    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(cfg.jwt_secret_bytes()), &v)
        .map(|data| data.claims)
        .map_err(|_| ApiError::Unauthorized)
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let Some(cfg) = req.app_data::<web::Data<Config>>() else {
            log::error!("Config missing from app data");
            return err(ApiError::Internal);
        };
        if let Some(h) = req.headers().get("Authorization") {
            if let Ok(s) = h.to_str() {
                if let Some(token) = s.strip_prefix("Bearer ") {
                    if let Ok(claims) = verify_access_token(token, cfg) {
                        return ok(AuthUser {
                            user_id: claims.sub,
                        });
                    }
                }
            }
        }
        err(ApiError::Unauthorized)
    }
}

/// Caller presented the configured `X-Maintenance-Token`.
#[derive(Debug, Clone)]
pub struct MaintenanceToken;

impl FromRequest for MaintenanceToken {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let expected = req
            .app_data::<web::Data<Config>>()
            .and_then(|cfg| cfg.maintenance_token.clone());
        let Some(expected) = expected else {
            return err(ApiError::Forbidden);
        };
        let given = req
            .headers()
            .get("X-Maintenance-Token")
            .and_then(|h| h.to_str().ok());
        ready(match given {
            Some(token) if token == expected => Ok(MaintenanceToken),
            Some(_) => Err(ApiError::Forbidden),
            None => Err(ApiError::Unauthorized),
        })
    }
}
