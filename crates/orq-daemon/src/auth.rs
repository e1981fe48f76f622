//! Token normalisation and the admin gate.
//!
//! The transport layer accepts the admin token either as a bearer header
//! or as a `token` cookie and normalises both into [`Claims`] before any
//! handler runs. With no token configured (dev mode) every request is
//! authorized; with one configured, a mismatch is a 401 on everything
//! except `/v1/health`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use orq_dispatch::Claims;

use crate::error::ApiError;
use crate::state::AppState;

/// Extract the presented token from the Authorization header or cookie.
fn presented_token(req: &Request) -> Option<String> {
    if let Some(auth) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(bearer) = auth.strip_prefix("Bearer ") {
            return Some(bearer.trim().to_string());
        }
    }

    let cookies = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    for part in cookies.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("token=") {
            return Some(value.to_string());
        }
    }
    None
}

pub async fn require_token(
    State(st): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let claims = if st.config.token.is_empty() {
        Claims::authorized("dev")
    } else {
        match presented_token(&req) {
            Some(t) if t == st.config.token => Claims::authorized("operator"),
            _ => {
                if req.uri().path() == "/v1/health" {
                    Claims::anonymous()
                } else {
                    return Err(ApiError::unauthorized());
                }
            }
        }
    };

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header_name: header::HeaderName, value: &str) -> Request {
        axum::http::Request::builder()
            .uri("/v1/jobs")
            .header(header_name, value)
            .body(Body::empty())
            .expect("request builds")
    }

    #[test]
    fn bearer_header_is_normalised() {
        let req = request_with(header::AUTHORIZATION, "Bearer sekrit");
        assert_eq!(presented_token(&req).as_deref(), Some("sekrit"));
    }

    #[test]
    fn cookie_token_is_normalised() {
        let req = request_with(header::COOKIE, "theme=dark; token=sekrit; lang=en");
        assert_eq!(presented_token(&req).as_deref(), Some("sekrit"));
    }

    #[test]
    fn absent_token_is_none() {
        let req = axum::http::Request::builder()
            .uri("/v1/jobs")
            .body(Body::empty())
            .expect("request builds");
        assert_eq!(presented_token(&req), None);
    }
}
