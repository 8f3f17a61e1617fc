use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const STUDENT_ROLES: &[&str] = &["student"];
pub const INSTRUCTOR_ROLES: &[&str] = &["instructor", "admin"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub role: Option<String>,
}

/// Raw bearer token of the caller, forwarded to the exam backend.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

fn reject(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

fn authenticate(req: &Request, allowed: &[&str]) -> Result<(Claims, String), Response> {
    let Some(auth_header) = req.headers().get(axum::http::header::AUTHORIZATION) else {
        return Err(reject(StatusCode::UNAUTHORIZED, "missing_authorization"));
    };
    let Ok(auth_str) = auth_header.to_str() else {
        return Err(reject(StatusCode::UNAUTHORIZED, "bad_authorization"));
    };
    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return Err(reject(StatusCode::UNAUTHORIZED, "unsupported_scheme"));
    };

    let config = crate::config::get_config();
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|_| reject(StatusCode::UNAUTHORIZED, "invalid_token"))?;

    let role = data.claims.role.clone().unwrap_or_default();
    if !allowed.is_empty() && !allowed.iter().any(|r| r.eq_ignore_ascii_case(&role)) {
        return Err(reject(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok((data.claims, token.to_string()))
}

pub async fn require_roles(mut req: Request, next: Next, allowed: &[&str]) -> Response {
    match authenticate(&req, allowed) {
        Ok((claims, token)) => {
            req.extensions_mut().insert(claims);
            req.extensions_mut().insert(BearerToken(token));
            next.run(req).await
        }
        Err(response) => response,
    }
}

pub async fn require_student(req: Request, next: Next) -> Response {
    require_roles(req, next, STUDENT_ROLES).await
}

pub async fn require_instructor(req: Request, next: Next) -> Response {
    require_roles(req, next, INSTRUCTOR_ROLES).await
}
