//! Cache layer configuration.
//!
//! Presets per deployment environment, then `APICACHE_*` environment
//! variable overrides on top. Overrides go through a lookup function so the
//! same code path is testable without touching the process environment.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Deployment environment. Controls whether profiling data is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Local,
    Test,
}

impl Environment {
    /// Local and staging deployments may expose timing headers to clients.
    pub fn exposes_debug_headers(self) -> bool {
        matches!(self, Self::Local | Self::Staging)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            "local" | "development" | "dev" => Ok(Self::Local),
            "test" | "testing" => Ok(Self::Test),
            other => Err(format!("unknown environment `{other}`")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Local => "local",
            Self::Test => "test",
        })
    }
}

/// Tunables for the cache gate, compression and freshness stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub environment: Environment,
    /// When false the gate forwards every request untouched.
    pub enabled: bool,
    pub default_ttl_seconds: u64,
    /// How long one request may hold recomputation rights for a key.
    pub lock_lease_seconds: u64,
    /// How long a request waits for the recomputation lock.
    pub lock_wait_millis: u64,
    /// Pause before re-reading the cache after losing the lock race.
    pub contention_retry_millis: u64,
    pub compression_min_bytes: usize,
    /// A compressed body is kept only if `compressed < original * ratio`.
    pub compression_max_ratio: f64,
    pub etag_max_bytes: usize,
    /// Emit `X-Perf-*` timing headers from the cache gate.
    pub profiling: bool,
    /// Cookie whose presence marks a session as authenticated.
    pub session_cookie: String,
}

impl Default for CacheConfig {
    /// Production settings.
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            enabled: true,
            default_ttl_seconds: 300,
            lock_lease_seconds: 10,
            lock_wait_millis: 2_000,
            contention_retry_millis: 100,
            compression_min_bytes: 1024,
            compression_max_ratio: 0.9,
            etag_max_bytes: 100_000,
            profiling: false,
            session_cookie: "session".to_string(),
        }
    }
}

impl CacheConfig {
    /// Preset for `environment`: production defaults, with profiling turned on
    /// for local and staging, and short waits for tests.
    pub fn for_environment(environment: Environment) -> Self {
        let base = Self {
            environment,
            ..Self::default()
        };
        match environment {
            Environment::Production => base,
            Environment::Staging | Environment::Local => Self {
                profiling: true,
                ..base
            },
            Environment::Test => Self {
                lock_wait_millis: 500,
                contention_retry_millis: 20,
                ..base
            },
        }
    }

    /// Load configuration from the process environment.
    ///
    /// The preset comes from `APICACHE_ENV` (or `APP_ENV`), defaulting to
    /// production; `APICACHE_*` overrides are applied on top.
    pub fn from_environment() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_environment`](Self::from_environment) with an explicit
    /// variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("APICACHE_ENV")
            .or_else(|| lookup("APP_ENV"))
            .map(|raw| {
                raw.parse().unwrap_or_else(|e: String| {
                    warn!(error = %e, "falling back to production cache configuration");
                    Environment::Production
                })
            })
            .unwrap_or(Environment::Production);

        info!(%environment, "loading cache configuration");
        Self::for_environment(environment).with_overrides(lookup)
    }

    /// Applies `APICACHE_*` overrides. Unparseable values are logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "APICACHE_ENABLED", &mut self.enabled);
        override_from(&lookup, "APICACHE_DEFAULT_TTL_SECONDS", &mut self.default_ttl_seconds);
        override_from(&lookup, "APICACHE_LOCK_LEASE_SECONDS", &mut self.lock_lease_seconds);
        override_from(&lookup, "APICACHE_LOCK_WAIT_MILLIS", &mut self.lock_wait_millis);
        override_from(
            &lookup,
            "APICACHE_CONTENTION_RETRY_MILLIS",
            &mut self.contention_retry_millis,
        );
        override_from(&lookup, "APICACHE_COMPRESSION_MIN_BYTES", &mut self.compression_min_bytes);
        override_from(&lookup, "APICACHE_ETAG_MAX_BYTES", &mut self.etag_max_bytes);
        override_from(&lookup, "APICACHE_PROFILING", &mut self.profiling);
        if let Some(cookie) = lookup("APICACHE_SESSION_COOKIE").filter(|c| !c.trim().is_empty()) {
            self.session_cookie = cookie.trim().to_string();
        }
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_seconds)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_millis)
    }

    pub fn contention_retry(&self) -> Duration {
        Duration::from_millis(self.contention_retry_millis)
    }
}

fn override_from<F, T>(lookup: &F, name: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + fmt::Debug,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            info!(variable = name, value = ?value, "cache configuration override");
            *slot = value;
        }
        Err(_) => warn!(variable = name, value = %raw, "ignoring unparseable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_production_contract() {
        let c = CacheConfig::default();
        assert_eq!(c.default_ttl(), Duration::from_secs(300));
        assert_eq!(c.lock_lease(), Duration::from_secs(10));
        assert_eq!(c.lock_wait(), Duration::from_secs(2));
        assert_eq!(c.contention_retry(), Duration::from_millis(100));
        assert_eq!(c.compression_min_bytes, 1024);
        assert_eq!(c.etag_max_bytes, 100_000);
        assert!(!c.profiling);
    }

    #[test]
    fn app_env_selects_preset() {
        let c = CacheConfig::from_lookup(lookup(&[("APP_ENV", "staging")]));
        assert_eq!(c.environment, Environment::Staging);
        assert!(c.profiling);
    }

    #[test]
    fn apicache_env_wins_over_app_env() {
        let c = CacheConfig::from_lookup(lookup(&[("APP_ENV", "local"), ("APICACHE_ENV", "prod")]));
        assert_eq!(c.environment, Environment::Production);
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let c = CacheConfig::from_lookup(lookup(&[
            ("APICACHE_ENABLED", "false"),
            ("APICACHE_LOCK_WAIT_MILLIS", "750"),
            ("APICACHE_DEFAULT_TTL_SECONDS", "soon"),
            ("APICACHE_SESSION_COOKIE", "shop_session"),
        ]));
        assert!(!c.enabled);
        assert_eq!(c.lock_wait(), Duration::from_millis(750));
        assert_eq!(c.default_ttl_seconds, 300);
        assert_eq!(c.session_cookie, "shop_session");
    }

    #[test]
    fn unknown_environment_falls_back_to_production() {
        let c = CacheConfig::from_lookup(lookup(&[("APICACHE_ENV", "moon")]));
        assert_eq!(c.environment, Environment::Production);
    }

    #[test]
    fn deserializes_partial_documents() {
        let c: CacheConfig =
            serde_json::from_str(r#"{"environment":"local","lock_wait_millis":250}"#).unwrap();
        assert_eq!(c.environment, Environment::Local);
        assert_eq!(c.lock_wait_millis, 250);
        assert_eq!(c.default_ttl_seconds, 300);
    }
}
