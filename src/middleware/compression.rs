//! Response compression.
//!
//! JSON bodies above a size floor are compressed with brotli or gzip,
//! whichever the client prefers to accept, in that order. A candidate is
//! only kept when it is meaningfully smaller than the original.

use std::io::Write;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, warn};

use super::{BoxResponse, Middleware, Next};
use crate::Response;
use crate::cache::{CacheError, CacheStatus, ContentKind};
use crate::config::CacheConfig;
use crate::context::Context;

const GZIP_LEVEL: u32 = 4;
#[cfg(feature = "brotli")]
const BROTLI_QUALITY: u32 = 4;
#[cfg(feature = "brotli")]
const BROTLI_LGWIN: u32 = 22;
#[cfg(feature = "brotli")]
const BROTLI_BUFFER: usize = 4096;

/// A content coding this stage can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Brotli,
    Gzip,
}

impl Encoding {
    /// Token used in `Accept-Encoding` / `Content-Encoding`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Brotli => "br",
            Self::Gzip => "gzip",
        }
    }

    /// Whether this build can encode it.
    pub fn is_available(self) -> bool {
        match self {
            Self::Brotli => cfg!(feature = "brotli"),
            Self::Gzip => true,
        }
    }
}

/// Encodings to try for an `Accept-Encoding` value, best first.
///
/// Tokens with `q=0` are refused; `*` accepts anything not refused.
/// Brotli is omitted when the crate is built without it.
pub fn negotiate(accept_encoding: Option<&str>) -> Vec<Encoding> {
    let Some(header) = accept_encoding else {
        return Vec::new();
    };

    let mut wildcard = false;
    let mut accepted = Vec::new();
    let mut refused = Vec::new();
    for part in header.split(',') {
        let mut fields = part.split(';');
        let token = fields.next().unwrap_or("").trim().to_ascii_lowercase();
        let allowed = fields
            .filter_map(|p| p.trim().strip_prefix("q="))
            .all(|q| q.trim().parse::<f32>().map_or(true, |q| q > 0.0));
        let target = if allowed { &mut accepted } else { &mut refused };
        match token.as_str() {
            "br" => target.push(Encoding::Brotli),
            "gzip" | "x-gzip" => target.push(Encoding::Gzip),
            "*" => wildcard = allowed,
            _ => {}
        }
    }

    [Encoding::Brotli, Encoding::Gzip]
        .into_iter()
        .filter(|e| e.is_available())
        .filter(|e| !refused.contains(e))
        .filter(|e| accepted.contains(e) || wildcard)
        .collect()
}

/// Compresses `body` with `encoding`.
pub fn encode(encoding: Encoding, body: &[u8]) -> Result<Bytes, CacheError> {
    match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(
                Vec::with_capacity(body.len() / 2),
                Compression::new(GZIP_LEVEL),
            );
            encoder.write_all(body)?;
            Ok(Bytes::from(encoder.finish()?))
        }
        #[cfg(feature = "brotli")]
        Encoding::Brotli => {
            let mut writer = brotli::CompressorWriter::new(
                Vec::with_capacity(body.len() / 2),
                BROTLI_BUFFER,
                BROTLI_QUALITY,
                BROTLI_LGWIN,
            );
            writer.write_all(body)?;
            Ok(Bytes::from(writer.into_inner()))
        }
        #[cfg(not(feature = "brotli"))]
        Encoding::Brotli => Err(CacheError::Compression(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "built without brotli support",
        ))),
    }
}

/// A compressed body is kept only if it is below `max_ratio` of the
/// original size.
pub fn worthwhile(original: usize, compressed: usize, max_ratio: f64) -> bool {
    original > 0 && (compressed as f64) < (original as f64) * max_ratio
}

/// Compresses eligible responses on the way out.
#[derive(Debug, Clone)]
pub struct CompressionMiddleware {
    min_bytes: usize,
    max_ratio: f64,
}

impl CompressionMiddleware {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            min_bytes: config.compression_min_bytes,
            max_ratio: config.compression_max_ratio,
        }
    }

    /// Applies the best acceptable encoding to `response`, or leaves it as is.
    pub fn compress(&self, mut response: Response, accept_encoding: Option<&str>) -> Response {
        if !self.is_eligible(&response) {
            return response;
        }

        let original = response.content().clone();
        for encoding in negotiate(accept_encoding) {
            let compressed = match encode(encoding, &original) {
                Ok(compressed) => compressed,
                Err(e) => {
                    warn!(encoding = encoding.as_str(), error = %e, "compression failed");
                    continue;
                }
            };
            if !worthwhile(original.len(), compressed.len(), self.max_ratio) {
                debug!(
                    encoding = encoding.as_str(),
                    original = original.len(),
                    compressed = compressed.len(),
                    "compression not worth it"
                );
                continue;
            }

            debug!(
                encoding = encoding.as_str(),
                original = original.len(),
                compressed = compressed.len(),
                "compressed response"
            );
            response.set_content(compressed);
            response.set_header("Content-Encoding", encoding.as_str());
            if !response.headers().has_token("Vary", "Accept-Encoding") {
                response.add_header("Vary", "Accept-Encoding");
            }
            response.headers_mut().remove("Content-Length");
            return response;
        }
        response
    }

    fn is_eligible(&self, response: &Response) -> bool {
        CacheStatus::of(response) != Some(CacheStatus::Hit)
            && !response.headers().contains("Content-Encoding")
            && ContentKind::of(response) == ContentKind::Json
            && response.content().len() >= self.min_bytes
    }
}

impl Middleware for CompressionMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let stage = self.clone();
        Box::pin(async move {
            let accept = ctx
                .request()
                .headers()
                .get("Accept-Encoding")
                .map(str::to_string);
            let response = next.run(ctx).await;
            stage.compress(response, accept.as_deref())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn json_body(len: usize) -> String {
        let mut body = String::from(r#"{"items":["#);
        while body.len() < len - 2 {
            body.push_str(r#""whey","#);
        }
        body.truncate(len - 2);
        body.push_str("]}");
        body
    }

    fn json(body: String) -> Response {
        Response::new(StatusCode::OK)
            .header("Content-Type", "application/json")
            .header("Content-Length", body.len().to_string())
            .body(body)
    }

    fn stage() -> CompressionMiddleware {
        CompressionMiddleware::new(&CacheConfig::default())
    }

    #[test]
    fn negotiation_respects_q_values_and_wildcards() {
        assert_eq!(negotiate(None), vec![]);
        assert_eq!(negotiate(Some("gzip")), vec![Encoding::Gzip]);
        assert_eq!(negotiate(Some("identity")), vec![]);
        assert_eq!(negotiate(Some("gzip;q=0, deflate")), vec![]);
        if cfg!(feature = "brotli") {
            assert_eq!(
                negotiate(Some("gzip, deflate, br")),
                vec![Encoding::Brotli, Encoding::Gzip]
            );
            assert_eq!(negotiate(Some("*, br;q=0")), vec![Encoding::Gzip]);
        } else {
            assert_eq!(negotiate(Some("br, gzip")), vec![Encoding::Gzip]);
        }
    }

    #[test]
    fn ratio_guard() {
        assert!(worthwhile(2000, 1000, 0.9));
        assert!(worthwhile(2000, 1799, 0.9));
        assert!(!worthwhile(2000, 1800, 0.9));
        assert!(!worthwhile(2000, 1900, 0.9));
        assert!(!worthwhile(0, 0, 0.9));
    }

    #[test]
    fn small_bodies_are_left_alone() {
        let resp = stage().compress(json(json_body(500)), Some("gzip"));
        assert!(!resp.headers().contains("Content-Encoding"));
        assert_eq!(resp.content().len(), 500);
    }

    #[test]
    fn gzip_round_trips_and_drops_length() {
        let body = json_body(2000);
        let resp = stage().compress(json(body.clone()), Some("gzip"));

        assert_eq!(resp.headers().get("Content-Encoding"), Some("gzip"));
        assert_eq!(resp.headers().get("Vary"), Some("Accept-Encoding"));
        assert!(!resp.headers().contains("Content-Length"));
        assert!(resp.content().len() < 1800);

        let mut decoded = String::new();
        GzDecoder::new(resp.content().as_ref())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[cfg(feature = "brotli")]
    #[test]
    fn brotli_is_preferred() {
        let body = json_body(4000);
        let resp = stage().compress(json(body.clone()), Some("gzip, br"));
        assert_eq!(resp.headers().get("Content-Encoding"), Some("br"));

        let mut decoded = Vec::new();
        brotli::BrotliDecompress(&mut resp.content().as_ref(), &mut decoded).unwrap();
        assert_eq!(decoded, body.as_bytes());
    }

    #[test]
    fn cache_hits_and_non_json_pass_through() {
        let hit = json(json_body(2000)).header("X-Cache", "HIT");
        let resp = stage().compress(hit, Some("gzip"));
        assert!(!resp.headers().contains("Content-Encoding"));

        let text = Response::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body("a".repeat(4000));
        let resp = stage().compress(text, Some("gzip"));
        assert!(!resp.headers().contains("Content-Encoding"));
    }

    #[test]
    fn existing_vary_is_extended_not_duplicated() {
        let resp = json(json_body(2000)).header("Vary", "Origin");
        let resp = stage().compress(resp, Some("gzip"));
        let vary: Vec<_> = resp.headers().get_all("vary").collect();
        assert_eq!(vary, vec!["Origin", "Accept-Encoding"]);

        let resp = json(json_body(2000)).header("Vary", "accept-encoding");
        let resp = stage().compress(resp, Some("gzip"));
        assert_eq!(resp.headers().get_all("vary").count(), 1);
    }

    #[test]
    fn incompressible_payload_stays_identity() {
        // Pseudo-random digits cannot shrink below ~40% of their size.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let digits: String = (0..3000)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                char::from(b'0' + (seed % 10) as u8)
            })
            .collect();
        let body = format!(r#"{{"n":"{digits}"}}"#);
        let strict = CompressionMiddleware {
            min_bytes: 1024,
            max_ratio: 0.3,
        };
        let resp = strict.compress(json(body.clone()), Some("gzip"));
        assert!(!resp.headers().contains("Content-Encoding"));
        assert_eq!(resp.content().as_ref(), body.as_bytes());
    }
}
