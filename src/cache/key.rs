//! Cache key derivation.
//!
//! A key is the SHA-256 of `"<METHOD> <full url>"`. The URL is hashed
//! verbatim, so `?a=1&b=2` and `?b=2&a=1` are different keys.

use sha2::{Digest, Sha256};

use crate::{Method, Request};

/// Namespace for stored responses.
pub const RESPONSE_NAMESPACE: &str = "api_cache:";
/// Namespace for recomputation locks.
pub const LOCK_NAMESPACE: &str = "api_cache_lock:";

/// Identity of a cacheable request.
///
/// # Examples
///
/// ```
/// use apicache::cache::CacheKey;
/// use apicache::Method;
///
/// let key = CacheKey::new(&Method::Get, "http://shop.local/products?page=1");
/// assert!(key.entry_key().starts_with("api_cache:"));
/// assert!(key.lock_key().starts_with("api_cache_lock:"));
/// assert_eq!(key.digest().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(url.as_bytes());
        Self {
            digest: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method(), &request.full_url())
    }

    /// Lowercase hex digest without namespace.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn entry_key(&self) -> String {
        format!("{RESPONSE_NAMESPACE}{}", self.digest)
    }

    pub fn lock_key(&self) -> String {
        format!("{LOCK_NAMESPACE}{}", self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_request_same_key() {
        let a = Request::get("/products?page=1").with_header("Host", "shop.local");
        let b = Request::get("/products?page=1").with_header("Host", "shop.local");
        assert_eq!(CacheKey::for_request(&a), CacheKey::for_request(&b));
    }

    #[test]
    fn query_order_is_significant() {
        let a = CacheKey::new(&Method::Get, "http://h/p?a=1&b=2");
        let b = CacheKey::new(&Method::Get, "http://h/p?b=2&a=1");
        assert_ne!(a, b);
    }

    #[test]
    fn method_is_part_of_identity() {
        let get = CacheKey::new(&Method::Get, "http://h/p");
        let head = CacheKey::new(&Method::Head, "http://h/p");
        assert_ne!(get, head);
    }

    #[test]
    fn lowercase_method_normalizes() {
        let parsed: Method = "get".parse().unwrap();
        assert_eq!(
            CacheKey::new(&parsed, "http://h/p"),
            CacheKey::new(&Method::Get, "http://h/p")
        );
    }

    #[test]
    fn namespaces_never_collide() {
        let key = CacheKey::new(&Method::Get, "http://h/p");
        assert_ne!(key.entry_key(), key.lock_key());
        assert!(key.entry_key().ends_with(key.digest()));
        assert!(key.lock_key().ends_with(key.digest()));
    }
}
