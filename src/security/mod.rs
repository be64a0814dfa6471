//! Caller identification.
//!
//! The response cache is shared by everyone, so it must never see requests
//! that carry credentials. [`SessionMiddleware`] runs in front of it and
//! marks such requests with a [`Principal`]; validating the credential is
//! left to the application.

use sha2::{Digest, Sha256};

use crate::Request;
use crate::config::CacheConfig;
use crate::context::{Context, Principal};
use crate::middleware::{BoxResponse, Middleware, Next};

/// Marks requests that carry a bearer token or a session cookie as
/// authenticated.
///
/// The [`Principal`] subject is a short digest of the credential so the raw
/// secret never ends up in logs.
///
/// # Examples
///
/// ```rust
/// use apicache::config::CacheConfig;
/// use apicache::security::SessionMiddleware;
///
/// let sessions = SessionMiddleware::new(&CacheConfig::default());
/// assert_eq!(sessions.cookie_name(), "session");
/// ```
#[derive(Debug, Clone)]
pub struct SessionMiddleware {
    cookie_name: String,
}

impl SessionMiddleware {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cookie_name: config.session_cookie.clone(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Returns the principal for `request`, if it carries credentials.
    pub fn identify(&self, request: &Request) -> Option<Principal> {
        if let Some(token) = bearer_token(request) {
            return Some(Principal {
                subject: format!("token:{}", fingerprint(token)),
            });
        }
        session_cookie(request, &self.cookie_name).map(|session| Principal {
            subject: format!("session:{}", fingerprint(session)),
        })
    }
}

impl Middleware for SessionMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponse {
        if let Some(principal) = self.identify(ctx.request()) {
            tracing::debug!(subject = %principal.subject, "authenticated request");
            ctx.extensions_mut().insert(principal);
        }
        Box::pin(next.run(ctx))
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    let value = request.headers().get("Authorization")?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn session_cookie<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get_all("Cookie")
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| key.trim() == name && !value.trim().is_empty())
        .map(|(_, value)| value.trim())
}

fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::{Response, StatusCode};

    fn sessions() -> SessionMiddleware {
        SessionMiddleware::new(&CacheConfig::default())
    }

    #[test]
    fn bearer_token_identifies_caller() {
        let req = Request::get("/").with_header("Authorization", "Bearer abc123");
        let principal = sessions().identify(&req).unwrap();
        assert!(principal.subject.starts_with("token:"));
        assert!(!principal.subject.contains("abc123"));
    }

    #[test]
    fn session_cookie_identifies_caller() {
        let req = Request::get("/").with_header("Cookie", "theme=dark; session=s3cr3t");
        let principal = sessions().identify(&req).unwrap();
        assert!(principal.subject.starts_with("session:"));
    }

    #[test]
    fn anonymous_requests_stay_anonymous() {
        for req in [
            Request::get("/"),
            Request::get("/").with_header("Authorization", "Basic Zm9vOmJhcg=="),
            Request::get("/").with_header("Authorization", "Bearer "),
            Request::get("/").with_header("Cookie", "session=; theme=dark"),
            Request::get("/").with_header("Cookie", "other_session=x"),
        ] {
            assert!(sessions().identify(&req).is_none());
        }
    }

    #[test]
    fn same_credential_same_subject() {
        let a = Request::get("/").with_header("Authorization", "bearer tok");
        let b = Request::get("/").with_header("Authorization", "Bearer tok");
        assert_eq!(sessions().identify(&a), sessions().identify(&b));
    }

    #[tokio::test]
    async fn principal_reaches_later_stages() {
        let pipeline = Pipeline::new(|ctx: Context| async move {
            let status = if ctx.is_authenticated() {
                StatusCode::OK
            } else {
                StatusCode::UNAUTHORIZED
            };
            Response::new(status)
        })
        .with(sessions());

        let authed = pipeline
            .handle(Context::new(
                Request::get("/").with_header("Cookie", "session=abc"),
            ))
            .await;
        assert_eq!(authed.status(), StatusCode::OK);

        let anon = pipeline.handle(Context::new(Request::get("/"))).await;
        assert_eq!(anon.status(), StatusCode::UNAUTHORIZED);
    }
}
