//! Per-request admission decisions.

use std::time::Duration;

use axum::http::HeaderMap;
use tracing::{debug, trace};

use super::bucket::Quota;
use super::cache::LimiterCache;
use super::key::{ClientKey, KeyResolver};
use crate::config::RateLimiterConfig;
use crate::error::{KeyResolutionError, Result};

/// Outcome of an admission check for a resolved client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed
    Admitted { key: ClientKey },
    /// The client is over its limit
    Rejected {
        key: ClientKey,
        /// Time until the client's next token
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    /// The client key the decision was made for.
    pub fn key(&self) -> &ClientKey {
        match self {
            Admission::Admitted { key } | Admission::Rejected { key, .. } => key,
        }
    }
}

/// Admission control state shared by every request handler.
///
/// Owns the limiter cache, the quota applied to newly seen clients, and the
/// key resolver. Build one at startup and share it behind an `Arc`.
pub struct AdmissionControl {
    cache: LimiterCache,
    quota: Quota,
    resolver: KeyResolver,
}

impl AdmissionControl {
    /// Create admission control from its parts.
    pub fn new(cache: LimiterCache, quota: Quota, resolver: KeyResolver) -> Self {
        Self {
            cache,
            quota,
            resolver,
        }
    }

    /// Create admission control from validated configuration.
    pub fn from_config(config: &RateLimiterConfig) -> Result<Self> {
        config.validate()?;

        let quota = Quota::new(config.rate, config.bucket)?;
        let cache = LimiterCache::with_shards(
            config.max_keys()?,
            config.ttl(),
            config.shard_count()?,
        );
        let resolver = KeyResolver::new(config.ip_header_name()?);

        Ok(Self::new(cache, quota, resolver))
    }

    /// Resolve the client for a request and apply its limiter.
    pub fn check(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<&str>,
    ) -> std::result::Result<Admission, KeyResolutionError> {
        let key = self.resolver.resolve(headers, remote_addr)?;
        Ok(self.check_key(key))
    }

    /// Apply the limiter for an already resolved client key.
    pub fn check_key(&self, key: ClientKey) -> Admission {
        let limiter = self.cache.get_or_create(&key, &self.quota);

        match limiter.try_acquire() {
            Ok(()) => {
                trace!(key = %key, "Request admitted");
                Admission::Admitted { key }
            }
            Err(retry_after) => {
                debug!(
                    key = %key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Admission::Rejected { key, retry_after }
            }
        }
    }

    /// The limiter cache.
    pub fn cache(&self) -> &LimiterCache {
        &self.cache
    }

    /// The quota applied to newly seen clients.
    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// The key resolver.
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn control(rate: f64, bucket: u32) -> AdmissionControl {
        let config = RateLimiterConfig {
            rate,
            bucket,
            ..RateLimiterConfig::default()
        };
        AdmissionControl::from_config(&config).unwrap()
    }

    #[test]
    fn test_from_config_applies_settings() {
        let config = RateLimiterConfig {
            rate: 2.5,
            bucket: 4,
            ip_header: Some("X-Real-IP".to_string()),
            max_keys: 32,
            ttl_secs: 30,
            shards: 4,
        };
        let control = AdmissionControl::from_config(&config).unwrap();

        assert_eq!(control.quota().rate(), 2.5);
        assert_eq!(control.quota().burst(), 4);
        assert_eq!(control.cache().capacity(), 32);
        assert_eq!(control.cache().ttl(), Duration::from_secs(30));
        assert_eq!(control.cache().shard_count(), 4);
        assert_eq!(control.resolver().ip_header().unwrap().as_str(), "x-real-ip");
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = RateLimiterConfig {
            rate: 0.0,
            ..RateLimiterConfig::default()
        };
        assert!(AdmissionControl::from_config(&config).is_err());
    }

    #[test]
    fn test_burst_then_rejection() {
        let control = control(1.0, 5);
        let headers = HeaderMap::new();

        for _ in 0..5 {
            let admission = control.check(&headers, Some("1.2.3.4:5555")).unwrap();
            assert!(admission.is_admitted());
            assert_eq!(admission.key().as_str(), "1.2.3.4");
        }

        match control.check(&headers, Some("1.2.3.4:5555")).unwrap() {
            Admission::Rejected { key, retry_after } => {
                assert_eq!(key.as_str(), "1.2.3.4");
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(1));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_clients_limited_independently() {
        let control = control(1.0, 1);
        let headers = HeaderMap::new();

        assert!(control.check(&headers, Some("1.1.1.1:1")).unwrap().is_admitted());
        assert!(!control.check(&headers, Some("1.1.1.1:2")).unwrap().is_admitted());
        assert!(control.check(&headers, Some("2.2.2.2:1")).unwrap().is_admitted());
    }

    #[test]
    fn test_header_identity_shares_limiter_across_addresses() {
        let control = control(1.0, 1);
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-address", HeaderValue::from_static("7.7.7.7"));

        assert!(control.check(&headers, Some("10.0.0.1:1")).unwrap().is_admitted());
        let second = control.check(&headers, Some("10.0.0.2:1")).unwrap();
        assert!(!second.is_admitted());
        assert_eq!(second.key().as_str(), "7.7.7.7");
    }

    #[test]
    fn test_default_config_evicts_only_beyond_max_keys() {
        let config = RateLimiterConfig {
            rate: 0.001,
            bucket: 1,
            max_keys: 3,
            ..RateLimiterConfig::default()
        };
        let control = AdmissionControl::from_config(&config).unwrap();
        assert_eq!(control.cache().shard_count(), 16);

        let clients = ["1.1.1.1", "2.2.2.2", "3.3.3.3"];
        for client in clients {
            assert!(control.check_key(client.into()).is_admitted());
        }
        assert_eq!(control.cache().len(), 3);

        // Every client is still tracked, so each stays drained
        for client in clients {
            assert!(!control.check_key(client.into()).is_admitted());
        }

        // A fourth client pushes out the least recently used one
        assert!(control.check_key("4.4.4.4".into()).is_admitted());
        assert_eq!(control.cache().len(), 3);
        assert!(control.cache().get(&"1.1.1.1".into()).is_none());
        assert!(!control.check_key("2.2.2.2".into()).is_admitted());
        assert!(!control.check_key("3.3.3.3".into()).is_admitted());
    }

    #[test]
    fn test_unresolvable_client_is_an_error() {
        let control = control(1.0, 1);
        let err = control.check(&HeaderMap::new(), Some("garbage")).unwrap_err();
        assert!(matches!(err, KeyResolutionError::Malformed { .. }));
        assert!(control.cache().is_empty());
    }
}
