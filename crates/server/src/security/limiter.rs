use crate::config::{RateLimitConfig, RateLimitSettings};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    Http,
    Register,
    Stream,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

/// Sliding-window request limiter keyed by caller identity and scope.
///
/// A caller may spend `burst` requests per `window`; the decision for a
/// rejected request carries how long until the oldest hit ages out.
#[derive(Debug)]
pub struct RateLimiter {
    settings: HashMap<RateScope, RateLimitSettings>,
    hits: Mutex<HashMap<(RateScope, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut settings = HashMap::new();
        settings.insert(RateScope::Http, config.http.clone());
        settings.insert(RateScope::Register, config.register.clone());
        settings.insert(RateScope::Stream, config.stream.clone());
        Self {
            settings,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, scope: RateScope, key: &str) -> RateDecision {
        let settings = match self.settings.get(&scope) {
            Some(value) => value.clone(),
            None => {
                return RateDecision {
                    allowed: true,
                    retry_after: None,
                };
            }
        };
        let mut guard = self.hits.lock().await;
        let now = Instant::now();
        let window = guard
            .entry((scope, key.to_string()))
            .or_insert_with(VecDeque::new);
        while let Some(front) = window.front() {
            if now.duration_since(*front) > settings.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() < settings.burst as usize {
            window.push_back(now);
            return RateDecision {
                allowed: true,
                retry_after: None,
            };
        }
        let retry_after = window
            .front()
            .map(|oldest| settings.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(settings.window);
        RateDecision {
            allowed: false,
            retry_after: Some(retry_after.max(Duration::from_millis(1))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn make_config() -> RateLimitConfig {
        let settings = RateLimitSettings {
            burst: 2,
            window: Duration::from_millis(50),
        };
        RateLimitConfig {
            http: settings.clone(),
            register: settings.clone(),
            stream: settings,
        }
    }

    #[tokio::test]
    async fn allows_within_burst() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "client-allow";
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
    }

    #[tokio::test]
    async fn blocks_over_burst_and_recovers() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "client-burst";
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
        let decision = limiter.check(RateScope::Http, identity).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after.is_some());
        sleep(Duration::from_millis(60)).await;
        assert!(limiter.check(RateScope::Http, identity).await.allowed);
    }

    #[tokio::test]
    async fn identities_do_not_share_budgets() {
        let limiter = RateLimiter::new(&make_config());
        assert!(limiter.check(RateScope::Http, "first").await.allowed);
        assert!(limiter.check(RateScope::Http, "first").await.allowed);
        assert!(!limiter.check(RateScope::Http, "first").await.allowed);
        assert!(limiter.check(RateScope::Http, "second").await.allowed);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let limiter = RateLimiter::new(&make_config());
        let identity = "client-scoped";
        assert!(limiter.check(RateScope::Register, identity).await.allowed);
        assert!(limiter.check(RateScope::Register, identity).await.allowed);
        assert!(!limiter.check(RateScope::Register, identity).await.allowed);
        assert!(limiter.check(RateScope::Stream, identity).await.allowed);
    }
}
