use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

pub const REALM: &str = "conductor";

/// Guard for the mutating routes, built from the `bearer_token` config
/// option. When no token is configured the router never installs this layer;
/// the streaming endpoints carry their token in stream metadata instead and
/// are checked in their own handlers.
#[derive(Clone)]
pub struct BearerAuth {
    token: Arc<str>,
}

impl BearerAuth {
    pub fn new(token: &str) -> Self {
        Self {
            token: Arc::from(token),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        *self.token == *candidate
    }
}

pub async fn require_bearer(
    State(auth): State<BearerAuth>,
    request: Request,
    next: Next,
) -> Response {
    let candidate = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match candidate {
        Some(candidate) if auth.matches(candidate) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                format!("Bearer realm=\"{}\"", REALM),
            )],
            "unauthorized",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_must_match_exactly() {
        let auth = BearerAuth::new("s3cret");
        assert!(auth.matches("s3cret"));
        assert!(!auth.matches("s3cret "));
        assert!(!auth.matches(""));
    }
}
