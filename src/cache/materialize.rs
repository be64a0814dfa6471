//! Cacheability decision for a downstream response.

use std::time::Duration;

use serde::de::IgnoredAny;

use super::{CacheEntry, CacheError};
use crate::Response;

/// Coarse media-type classification used by the gate and the compression
/// stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Other,
}

impl ContentKind {
    /// `Json` when the content type is, or contains, `application/json`
    /// (parameters such as `charset` are allowed). Matching ignores case.
    pub fn classify(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.to_ascii_lowercase().contains("application/json") => Self::Json,
            _ => Self::Other,
        }
    }

    pub fn of(response: &Response) -> Self {
        Self::classify(response.content_type())
    }
}

/// Turns a downstream response into a storable entry.
///
/// Returns `Ok(None)` for responses that are simply not cacheable (non-2xx
/// or non-JSON). A JSON-labelled body that does not parse is an
/// [`CacheError::Serialization`]. The stored body shares the response's
/// buffer; nothing is re-encoded.
pub fn materialize(
    key: &str,
    response: &Response,
    ttl: Duration,
) -> Result<Option<CacheEntry>, CacheError> {
    if !response.status().is_success() || ContentKind::of(response) != ContentKind::Json {
        return Ok(None);
    }

    let body = response.content();
    serde_json::from_slice::<IgnoredAny>(body)?;

    Ok(Some(CacheEntry {
        key: key.to_string(),
        body: body.clone(),
        status: response.status().as_u16(),
        content_type: response
            .content_type()
            .unwrap_or("application/json")
            .to_string(),
        ttl_seconds: ttl.as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    const TTL: Duration = Duration::from_secs(300);

    fn json(status: StatusCode, body: &'static str) -> Response {
        Response::new(status)
            .header("Content-Type", "application/json")
            .body(body)
    }

    #[test]
    fn classifier_accepts_parameters_and_case() {
        assert_eq!(
            ContentKind::classify(Some("Application/JSON; charset=utf-8")),
            ContentKind::Json
        );
        assert_eq!(ContentKind::classify(Some("text/plain")), ContentKind::Other);
        assert_eq!(ContentKind::classify(None), ContentKind::Other);
    }

    #[test]
    fn successful_json_is_stored_verbatim() {
        let resp = json(StatusCode::OK, r#"{"items":[1,2,3]}"#);
        let entry = materialize("api_cache:x", &resp, TTL).unwrap().unwrap();
        assert_eq!(entry.body.as_ref(), br#"{"items":[1,2,3]}"#);
        assert_eq!(entry.status, 200);
        assert_eq!(entry.content_type, "application/json");
        assert_eq!(entry.ttl_seconds, 300);
    }

    #[test]
    fn error_statuses_are_never_stored() {
        let resp = json(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#);
        assert!(materialize("k", &resp, TTL).unwrap().is_none());
        let resp = json(StatusCode::NOT_FOUND, r#"{"error":"missing"}"#);
        assert!(materialize("k", &resp, TTL).unwrap().is_none());
    }

    #[test]
    fn plain_text_is_never_stored() {
        let resp = Response::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body("[1,2,3]");
        assert!(materialize("k", &resp, TTL).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let resp = json(StatusCode::OK, r#"{"items":[1,2"#);
        assert!(matches!(
            materialize("k", &resp, TTL),
            Err(CacheError::Serialization(_))
        ));
    }
}
