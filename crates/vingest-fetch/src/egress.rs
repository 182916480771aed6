//! Egress identity pool.
//!
//! Maintains a cached list of outbound proxy identities fetched from
//! the admin API, sorted best-first. When the admin API is unreachable
//! the pool falls back to hardcoded identities; results for those are
//! never reported.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::FetchResult;

/// How long a fetched identity list stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Smoothing factor for the success-rate moving average.
const SUCCESS_RATE_ALPHA: f64 = 0.2;

/// One outbound egress identity.
#[derive(Debug, Clone)]
pub struct EgressIdentity {
    pub id: String,
    /// Proxy URL; empty means a direct connection
    pub url: String,
    pub priority: i32,
    pub success_rate: f64,
}

impl EgressIdentity {
    /// Hardcoded identities are fallbacks and never reported on.
    pub fn is_hardcoded(&self) -> bool {
        self.id.starts_with("hardcoded-")
    }
}

/// Admin API wire shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminIdentity {
    id: String,
    url: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    success_rate: f64,
}

/// Pool configuration.
#[derive(Debug, Clone, Default)]
pub struct EgressPoolConfig {
    /// Admin API base URL; without it the pool runs on fallbacks only
    pub admin_url: Option<String>,
    /// `x-internal-secret` header value
    pub admin_secret: Option<String>,
    /// Comma-separated fallback proxy URLs
    pub fallback_proxies: Vec<String>,
}

impl EgressPoolConfig {
    pub fn from_env() -> Self {
        Self {
            admin_url: std::env::var("ADMIN_API_URL").ok(),
            admin_secret: std::env::var("ADMIN_API_SECRET").ok(),
            fallback_proxies: std::env::var("EGRESS_FALLBACK_PROXIES")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

struct CachedList {
    identities: Vec<EgressIdentity>,
    fetched_at: Option<Instant>,
}

/// Cached, health-aware egress identity pool.
pub struct EgressPool {
    config: EgressPoolConfig,
    client: reqwest::Client,
    cache: RwLock<CachedList>,
}

impl EgressPool {
    pub fn new(config: EgressPoolConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            cache: RwLock::new(CachedList {
                identities: Vec::new(),
                fetched_at: None,
            }),
        }
    }

    /// Current identity list, best-first. Refreshes the cache when
    /// stale; serves the fallback list when the admin API fails.
    pub async fn list(&self) -> Vec<EgressIdentity> {
        let needs_refresh = {
            let cache = self.cache.read().expect("egress cache lock");
            match cache.fetched_at {
                Some(at) => at.elapsed() > CACHE_TTL,
                None => true,
            }
        };

        if needs_refresh {
            match self.fetch_from_admin().await {
                Ok(mut identities) => {
                    sort_identities(&mut identities);
                    info!(count = identities.len(), "Refreshed egress identity list");
                    let mut cache = self.cache.write().expect("egress cache lock");
                    cache.identities = identities;
                    cache.fetched_at = Some(Instant::now());
                }
                Err(e) => {
                    warn!(error = %e, "Egress admin fetch failed, using fallback identities");
                    let mut cache = self.cache.write().expect("egress cache lock");
                    if cache.identities.is_empty() {
                        cache.identities = self.fallback_identities();
                    }
                    // Back off further fetch attempts for a full TTL.
                    cache.fetched_at = Some(Instant::now());
                }
            }
        }

        let cache = self.cache.read().expect("egress cache lock");
        if cache.identities.is_empty() {
            self.fallback_identities()
        } else {
            cache.identities.clone()
        }
    }

    /// Record the outcome of a download attempt through an identity.
    /// Hardcoded identities are skipped.
    pub fn report_result(&self, identity_url: &str, success: bool, response_ms: Option<u64>) {
        let mut cache = self.cache.write().expect("egress cache lock");
        let Some(identity) = cache
            .identities
            .iter_mut()
            .find(|i| i.url == identity_url)
        else {
            return;
        };
        if identity.is_hardcoded() {
            return;
        }

        let observed = if success { 100.0 } else { 0.0 };
        identity.success_rate =
            identity.success_rate * (1.0 - SUCCESS_RATE_ALPHA) + observed * SUCCESS_RATE_ALPHA;
        debug!(
            identity = %identity.id,
            success,
            response_ms = ?response_ms,
            success_rate = identity.success_rate,
            "Recorded egress result"
        );
        sort_identities(&mut cache.identities);
    }

    async fn fetch_from_admin(&self) -> FetchResult<Vec<EgressIdentity>> {
        let base = self.config.admin_url.as_deref().ok_or_else(|| {
            crate::error::FetchError::unavailable("no egress admin API configured")
        })?;

        let mut request = self
            .client
            .get(format!("{}/api/internal/proxies", base.trim_end_matches('/')))
            .timeout(Duration::from_secs(10));
        if let Some(secret) = &self.config.admin_secret {
            request = request.header("x-internal-secret", secret);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(crate::error::FetchError::unavailable(format!(
                "egress admin API returned HTTP {}",
                response.status()
            )));
        }

        let raw: Vec<AdminIdentity> = response.json().await?;
        Ok(raw
            .into_iter()
            .filter(|i| {
                i.status
                    .as_deref()
                    .map(|s| s.eq_ignore_ascii_case("active"))
                    .unwrap_or(true)
            })
            .map(|i| EgressIdentity {
                id: i.id,
                url: i.url,
                priority: i.priority,
                success_rate: i.success_rate,
            })
            .collect())
    }

    fn fallback_identities(&self) -> Vec<EgressIdentity> {
        if self.config.fallback_proxies.is_empty() {
            // Direct connection as the last resort.
            return vec![EgressIdentity {
                id: "hardcoded-direct".to_string(),
                url: String::new(),
                priority: 0,
                success_rate: 0.0,
            }];
        }
        self.config
            .fallback_proxies
            .iter()
            .enumerate()
            .map(|(i, url)| EgressIdentity {
                id: format!("hardcoded-{}", i + 1),
                url: url.clone(),
                priority: 0,
                success_rate: 0.0,
            })
            .collect()
    }
}

fn sort_identities(identities: &mut [EgressIdentity]) {
    identities.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then(
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, priority: i32, success_rate: f64) -> EgressIdentity {
        EgressIdentity {
            id: id.to_string(),
            url: format!("http://{}:8080", id),
            priority,
            success_rate,
        }
    }

    #[test]
    fn sorts_by_priority_then_success_rate() {
        let mut list = vec![
            identity("c", 1, 90.0),
            identity("a", 2, 10.0),
            identity("b", 2, 80.0),
        ];
        sort_identities(&mut list);
        let ids: Vec<&str> = list.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn hardcoded_prefix_detection() {
        assert!(identity("hardcoded-1", 0, 0.0).is_hardcoded());
        assert!(!identity("proxy-7", 0, 0.0).is_hardcoded());
    }

    #[tokio::test]
    async fn falls_back_without_admin_api() {
        let pool = EgressPool::new(EgressPoolConfig::default());
        let list = pool.list().await;
        assert_eq!(list.len(), 1);
        assert!(list[0].is_hardcoded());
        assert!(list[0].url.is_empty());
    }

    #[tokio::test]
    async fn report_result_skips_hardcoded() {
        let pool = EgressPool::new(EgressPoolConfig {
            fallback_proxies: vec!["http://fallback:8080".to_string()],
            ..Default::default()
        });
        let list = pool.list().await;
        assert_eq!(list[0].id, "hardcoded-1");

        pool.report_result("http://fallback:8080", true, Some(100));
        let list = pool.list().await;
        assert_eq!(list[0].success_rate, 0.0);
    }

    #[test]
    fn admin_wire_shape_parses() {
        let json = r#"[{"id":"p1","url":"http://u:p@host:1","host":"host","port":1,
            "username":"u","password":"p","type":"http","status":"active",
            "priority":5,"successRate":92.5}]"#;
        let parsed: Vec<AdminIdentity> = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed[0].priority, 5);
        assert_eq!(parsed[0].success_rate, 92.5);
    }
}
