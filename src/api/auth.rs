use anyhow::Result;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AppState;

/// JWT claims carried by the control-surface cookie
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Username the token was issued to
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Creates and verifies the bearer-cookie tokens
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn create_token(&self, username: &str, max_age_secs: u64) -> Result<String> {
        let now = chrono::Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            exp: now.timestamp() + max_age_secs as i64,
            iat: now.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(Into::into)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(Into::into)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// `POST /auth/login` — issue the cookie credential
pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    let api = &state.ctx.config.api;
    if body.username != api.username || body.password != api.password {
        return (StatusCode::UNAUTHORIZED, "Invalid username or password").into_response();
    }

    let token = match state.jwt.create_token(&body.username, api.cookie_max_age_secs) {
        Ok(token) => token,
        Err(e) => {
            debug!("Token creation failed: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let cookie = format!(
        "token={}; Max-Age={}; Path=/; HttpOnly",
        token, api.cookie_max_age_secs
    );
    ([(header::SET_COOKIE, cookie)], StatusCode::OK).into_response()
}

/// Pull the token out of the request's cookie header
fn token_from_cookies(request: &Request) -> Option<String> {
    let cookies = request.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "token").then(|| value.to_string())
    })
}

/// Middleware guarding everything except the login endpoint itself
pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(token) = token_from_cookies(&request) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.jwt.verify_token(&token) {
        Ok(claims) if claims.sub == state.ctx.config.api.username => next.run(request).await,
        Ok(_) | Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify_token() {
        let service = JwtService::new("test_secret_key");
        let token = service.create_token("admin", 3600).unwrap();
        let claims = service.verify_token(&token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn invalid_token_is_rejected() {
        let service = JwtService::new("test_secret_key");
        assert!(service.verify_token("not-a-token").is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issued = JwtService::new("secret1");
        let verifier = JwtService::new("secret2");
        let token = issued.create_token("admin", 3600).unwrap();
        assert!(verifier.verify_token(&token).is_err());
    }
}
