//! Credential selection: round-robin over each provider's keys, skipping
//! keys that are cooling down after a 429.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ProxyConfig;
use crate::error::Result;

/// One API key plus how to present it.
#[derive(Clone)]
pub struct Credential {
    pub id: String,
    pub secret: String,
    pub auth_header: Option<String>,
    pub auth_format: Option<String>,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            auth_header: None,
            auth_format: None,
        }
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("auth_header", &self.auth_header)
            .finish_non_exhaustive()
    }
}

pub trait KeySelector: Send + Sync {
    /// Number of keys configured for a provider.
    fn pool_size(&self, provider: &str) -> usize;

    /// Next usable key, never one of `exclude`. `preferred` wins when it is
    /// usable. `None` means every remaining key is cooling down.
    fn acquire(&self, provider: &str, preferred: Option<&str>, exclude: &[String])
        -> Option<Credential>;

    fn report_outcome(&self, provider: &str, credential_id: &str, status: u16, latency: Duration);
}

#[derive(Debug, Default)]
struct KeyCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rate_limits: AtomicU64,
    total_latency_ms: AtomicU64,
    /// Milliseconds since the pool epoch; 0 when not cooling down.
    cooldown_until_ms: AtomicU64,
}

struct KeySlot {
    credential: Credential,
    counters: KeyCounters,
}

#[derive(Default)]
struct ProviderKeys {
    slots: Vec<KeySlot>,
    cursor: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub provider: String,
    pub id: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limits: u64,
    pub avg_latency_ms: u64,
    pub cooling_down: bool,
}

pub struct KeyPool {
    providers: HashMap<String, ProviderKeys>,
    cooldown: Duration,
    epoch: Instant,
}

impl KeyPool {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            cooldown,
            epoch: Instant::now(),
        }
    }

    /// Build the pool from every configured provider, resolving secrets.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let mut pool = Self::new(Duration::from_secs(config.rate_limit_cooldown_secs));
        for name in config.providers.keys() {
            for (i, key) in config.provider_keys(name).into_iter().enumerate() {
                let secret = key.resolve_secret()?;
                pool.add(
                    name,
                    Credential {
                        id: key.id_or_default(name, i),
                        secret,
                        auth_header: key.auth_header,
                        auth_format: key.auth_format,
                    },
                );
            }
        }
        Ok(pool)
    }

    pub fn add(&mut self, provider: &str, credential: Credential) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .slots
            .push(KeySlot {
                credential,
                counters: KeyCounters::default(),
            });
    }

    pub fn stats(&self) -> Vec<KeyStats> {
        let now = self.now_ms();
        let mut out: Vec<KeyStats> = self
            .providers
            .iter()
            .flat_map(|(provider, keys)| {
                keys.slots.iter().map(move |slot| {
                    let c = &slot.counters;
                    let requests = c.requests.load(Ordering::Relaxed);
                    KeyStats {
                        provider: provider.clone(),
                        id: slot.credential.id.clone(),
                        requests,
                        successes: c.successes.load(Ordering::Relaxed),
                        failures: c.failures.load(Ordering::Relaxed),
                        rate_limits: c.rate_limits.load(Ordering::Relaxed),
                        avg_latency_ms: c
                            .total_latency_ms
                            .load(Ordering::Relaxed)
                            .checked_div(requests)
                            .unwrap_or(0),
                        cooling_down: c.cooldown_until_ms.load(Ordering::Relaxed) > now,
                    }
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, &a.id).cmp(&(&b.provider, &b.id)));
        out
    }

    fn now_ms(&self) -> u64 {
        // +1 keeps a fresh pool's "now" distinct from the 0 sentinel.
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn usable(&self, slot: &KeySlot, exclude: &[String], now: u64) -> bool {
        !exclude.contains(&slot.credential.id)
            && slot.counters.cooldown_until_ms.load(Ordering::Relaxed) <= now
    }
}

impl KeySelector for KeyPool {
    fn pool_size(&self, provider: &str) -> usize {
        self.providers.get(provider).map_or(0, |k| k.slots.len())
    }

    fn acquire(
        &self,
        provider: &str,
        preferred: Option<&str>,
        exclude: &[String],
    ) -> Option<Credential> {
        let keys = self.providers.get(provider)?;
        let n = keys.slots.len();
        if n == 0 {
            return None;
        }
        let now = self.now_ms();

        if let Some(id) = preferred {
            if let Some(slot) = keys
                .slots
                .iter()
                .find(|s| s.credential.id == id && self.usable(s, exclude, now))
            {
                return Some(slot.credential.clone());
            }
        }

        let start = keys.cursor.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &keys.slots[(start + i) % n])
            .find(|slot| self.usable(slot, exclude, now))
            .map(|slot| slot.credential.clone())
    }

    fn report_outcome(&self, provider: &str, credential_id: &str, status: u16, latency: Duration) {
        let Some(slot) = self
            .providers
            .get(provider)
            .and_then(|k| k.slots.iter().find(|s| s.credential.id == credential_id))
        else {
            return;
        };
        let c = &slot.counters;
        c.requests.fetch_add(1, Ordering::Relaxed);
        c.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);

        if (200..300).contains(&status) {
            c.successes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        c.failures.fetch_add(1, Ordering::Relaxed);
        if status == 429 {
            c.rate_limits.fetch_add(1, Ordering::Relaxed);
            let until = self.now_ms() + self.cooldown.as_millis() as u64;
            c.cooldown_until_ms.store(until, Ordering::Relaxed);
            tracing::warn!(
                provider,
                key = credential_id,
                cooldown_secs = self.cooldown.as_secs(),
                "API key rate limited"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> KeyPool {
        let mut pool = KeyPool::new(Duration::from_secs(60));
        for i in 1..=n {
            pool.add("openai", Credential::new(format!("k{i}"), format!("sk-{i}")));
        }
        pool
    }

    #[test]
    fn test_round_robin() {
        let pool = pool(3);
        let ids: Vec<String> = (0..4)
            .map(|_| pool.acquire("openai", None, &[]).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["k1", "k2", "k3", "k1"]);
    }

    #[test]
    fn test_exclude_and_exhaustion() {
        let pool = pool(2);
        let tried = vec!["k1".to_string(), "k2".to_string()];
        assert!(pool.acquire("openai", None, &tried).is_none());
        assert_eq!(
            pool.acquire("openai", None, &tried[..1]).unwrap().id,
            "k2"
        );
        assert!(pool.acquire("gemini", None, &[]).is_none());
    }

    #[test]
    fn test_rate_limited_key_cools_down() {
        let pool = pool(2);
        pool.report_outcome("openai", "k1", 429, Duration::from_millis(10));
        for _ in 0..3 {
            assert_eq!(pool.acquire("openai", None, &[]).unwrap().id, "k2");
        }
        pool.report_outcome("openai", "k2", 429, Duration::from_millis(10));
        assert!(pool.acquire("openai", None, &[]).is_none());
    }

    #[test]
    fn test_preferred_key() {
        let pool = pool(3);
        assert_eq!(pool.acquire("openai", Some("k3"), &[]).unwrap().id, "k3");
        let tried = vec!["k3".to_string()];
        assert_ne!(pool.acquire("openai", Some("k3"), &tried).unwrap().id, "k3");
    }

    #[test]
    fn test_stats() {
        let pool = pool(2);
        pool.report_outcome("openai", "k1", 200, Duration::from_millis(100));
        pool.report_outcome("openai", "k1", 500, Duration::from_millis(300));
        pool.report_outcome("openai", "k2", 429, Duration::from_millis(5));

        let stats = pool.stats();
        assert_eq!(stats[0].id, "k1");
        assert_eq!(stats[0].requests, 2);
        assert_eq!(stats[0].successes, 1);
        assert_eq!(stats[0].failures, 1);
        assert_eq!(stats[0].avg_latency_ms, 200);
        assert!(!stats[0].cooling_down);
        assert_eq!(stats[1].rate_limits, 1);
        assert!(stats[1].cooling_down);
    }

    #[test]
    fn test_debug_hides_secret() {
        let cred = Credential::new("k1", "sk-secret");
        assert!(!format!("{cred:?}").contains("sk-secret"));
    }
}
