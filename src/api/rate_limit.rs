//! Rate limiting middleware using a sliding window algorithm.
//!
//! A single tier covers every API route; webhook delivery and the SSE log
//! stream share the same budget as ordinary requests.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::AppState;

#[derive(Debug, Clone)]
struct RateLimitEntry {
    tokens: u32,
    window_start: Instant,
    last_request: Instant,
}

impl RateLimitEntry {
    fn new(max_tokens: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: max_tokens,
            window_start: now,
            last_request: now,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<IpAddr, RateLimitEntry>,
    config: RateLimitConfig,
    window_duration: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            window_duration: Duration::from_secs(config.window_seconds),
            config,
        }
    }

    /// Checks if a request should be allowed and consumes a token if so.
    pub fn check_rate_limit(&self, ip: IpAddr) -> Result<RateLimitInfo, u64> {
        if !self.config.enabled {
            return Ok(RateLimitInfo {
                remaining: u32::MAX,
                limit: u32::MAX,
                reset_after: 0,
            });
        }

        let max_tokens = self.config.api_requests_per_window;
        let now = Instant::now();

        let mut entry = self.entries.entry(ip).or_insert_with(|| RateLimitEntry::new(max_tokens));

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= self.window_duration {
            entry.tokens = max_tokens;
            entry.window_start = now;
        } else {
            let since_last = now.duration_since(entry.last_request);
            let replenish_rate = max_tokens as f64 / self.window_duration.as_secs_f64();
            let replenished = (since_last.as_secs_f64() * replenish_rate) as u32;
            entry.tokens = (entry.tokens + replenished).min(max_tokens);
        }

        entry.last_request = now;

        if entry.tokens > 0 {
            entry.tokens -= 1;
            let remaining = entry.tokens;
            let reset_after = self.window_duration.saturating_sub(elapsed).as_secs();
            Ok(RateLimitInfo {
                remaining,
                limit: max_tokens,
                reset_after,
            })
        } else {
            let retry_after = self.window_duration.saturating_sub(elapsed).as_secs().max(1);
            Err(retry_after)
        }
    }

    /// Drops entries untouched for two window durations, bounding memory.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let expiry = self.window_duration * 2;
        self.entries.retain(|_, entry| now.duration_since(entry.window_start) < expiry);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub remaining: u32,
    pub limit: u32,
    pub reset_after: u64,
}

fn extract_client_ip(request: &Request<Body>) -> IpAddr {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip_str) = value.split(',').next() {
                if let Ok(ip) = ip_str.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    "127.0.0.1".parse().unwrap()
}

pub async fn rate_limit(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next) -> Result<Response, Response> {
    let ip = extract_client_ip(&request);

    match state.rate_limiter.check_rate_limit(ip) {
        Ok(info) => {
            let response = next.run(request).await;
            let (mut parts, body) = response.into_parts();
            parts.headers.insert("X-RateLimit-Limit", info.limit.to_string().parse().unwrap());
            parts.headers.insert("X-RateLimit-Remaining", info.remaining.to_string().parse().unwrap());
            parts.headers.insert("X-RateLimit-Reset", info.reset_after.to_string().parse().unwrap());
            Ok(Response::from_parts(parts, body))
        }
        Err(retry_after) => {
            let response = (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("Retry-After", retry_after.to_string()),
                    ("X-RateLimit-Limit", state.rate_limiter.config.api_requests_per_window.to_string()),
                    ("X-RateLimit-Remaining", "0".to_string()),
                    ("X-RateLimit-Reset", retry_after.to_string()),
                ],
                format!("Rate limit exceeded. Try again in {} seconds.", retry_after),
            );
            Err(response.into_response())
        }
    }
}

pub fn spawn_cleanup_task(rate_limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(rate_limiter.window_duration.as_secs().max(1) * 2);
        loop {
            tokio::time::sleep(interval).await;
            rate_limiter.cleanup_expired();
            tracing::debug!(entries = rate_limiter.entry_count(), "rate limiter cleanup complete");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            api_requests_per_window: 10,
            window_seconds: 60,
        }
    }

    #[test]
    fn allows_requests_under_limit() {
        let limiter = RateLimiter::new(test_config());
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        for i in 0..10 {
            assert!(limiter.check_rate_limit(ip).is_ok(), "request {i} should be allowed");
        }
    }

    #[test]
    fn blocks_after_limit() {
        let limiter = RateLimiter::new(test_config());
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        for _ in 0..10 {
            let _ = limiter.check_rate_limit(ip);
        }
        assert!(limiter.check_rate_limit(ip).is_err());
    }

    #[test]
    fn different_ips_have_separate_limits() {
        let limiter = RateLimiter::new(test_config());
        let ip1: IpAddr = "192.168.1.1".parse().unwrap();
        let ip2: IpAddr = "192.168.1.2".parse().unwrap();
        for _ in 0..10 {
            let _ = limiter.check_rate_limit(ip1);
        }
        assert!(limiter.check_rate_limit(ip2).is_ok());
    }

    #[test]
    fn disabled_rate_limiting_allows_everything() {
        let mut config = test_config();
        config.enabled = false;
        let limiter = RateLimiter::new(config);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        for _ in 0..100 {
            assert!(limiter.check_rate_limit(ip).is_ok());
        }
    }

    #[test]
    fn cleanup_does_not_remove_recent_entries() {
        let limiter = RateLimiter::new(test_config());
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        let _ = limiter.check_rate_limit(ip);
        assert_eq!(limiter.entry_count(), 1);
        limiter.cleanup_expired();
        assert_eq!(limiter.entry_count(), 1);
    }
}
