//! Retrying HTTP client (spec.md §4.D): backoff with jitter, `Retry-After`
//! honoring, and terminal-vs-retryable status classification.

use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Response, StatusCode};

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// A terminal or exhausted-retries failure, carrying the last response
/// received (if any) alongside the classified error.
pub struct SendError {
    pub error: AgentError,
    pub last_response: Option<Response>,
}

impl std::fmt::Debug for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendError")
            .field("error", &self.error)
            .field("has_response", &self.last_response.is_some())
            .finish()
    }
}

pub struct RetryingClient {
    http: Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(http: Client, policy: RetryPolicy) -> Self {
        Self { http, policy }
    }

    /// Send a request built fresh on every attempt by `factory`, retrying
    /// per the configured policy. `is_cancelled` is polled before each
    /// attempt and before each sleep so an external cancellation short
    /// circuits immediately without a further retry or delay.
    pub async fn send<F, C>(&self, mut factory: F, is_cancelled: C) -> Result<Response, SendError>
    where
        F: FnMut() -> Result<reqwest::Request, AgentError>,
        C: Fn() -> bool,
    {
        let mut delay = self.policy.initial_delay;

        for attempt in 1..=self.policy.max_attempts {
            if is_cancelled() {
                return Err(SendError {
                    error: AgentError::ContextCancelled,
                    last_response: None,
                });
            }

            let request = match factory() {
                Ok(r) => r,
                Err(e) => {
                    if attempt == self.policy.max_attempts {
                        return Err(SendError {
                            error: e,
                            last_response: None,
                        });
                    }
                    self.sleep_for(&mut delay, None, &is_cancelled).await;
                    continue;
                }
            };

            match self.http.execute(request).await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(SendError {
                            error: AgentError::RemoteAuth(format!("status {status}")),
                            last_response: Some(resp),
                        });
                    }
                    if status.as_u16() >= 500 || status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = retry_after_seconds(&resp);
                        drain(resp).await;
                        if attempt == self.policy.max_attempts {
                            return Err(SendError {
                                error: AgentError::RemoteTransient(format!(
                                    "status {status} after {attempt} attempts"
                                )),
                                last_response: None,
                            });
                        }
                        self.sleep_for(&mut delay, retry_after, &is_cancelled).await;
                        continue;
                    }
                    // Any other 4xx: terminal, no retry.
                    return Err(SendError {
                        error: AgentError::InvalidInput(format!("status {status}")),
                        last_response: Some(resp),
                    });
                }
                Err(e) => {
                    if e.is_timeout() || e.is_connect() || e.is_request() {
                        if attempt == self.policy.max_attempts {
                            return Err(SendError {
                                error: AgentError::RemoteTransient(e.to_string()),
                                last_response: None,
                            });
                        }
                        self.sleep_for(&mut delay, None, &is_cancelled).await;
                        continue;
                    }
                    return Err(SendError {
                        error: AgentError::RemoteTransient(e.to_string()),
                        last_response: None,
                    });
                }
            }
        }

        unreachable!("loop always returns within max_attempts iterations")
    }

    async fn sleep_for<C: Fn() -> bool>(&self, delay: &mut Duration, retry_after: Option<u64>, is_cancelled: &C) {
        if is_cancelled() {
            return;
        }
        let sleep_for = match retry_after {
            Some(secs) if secs <= 30 => Duration::from_secs(secs),
            _ => jittered(*delay),
        };
        tokio::time::sleep(sleep_for).await;
        *delay = (*delay * 2).min(self.policy.max_delay);
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.10);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_frac))
}

fn retry_after_seconds(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
}

/// Drain and close the response body before retrying, matching the
/// teacher's own `response.text().await.unwrap_or_default()` draining
/// style rather than a hand-rolled chunked read. `status()`/headers are
/// read by the caller before this runs, since `Response` is consumed by
/// value here and can't be resurrected afterward.
async fn drain(resp: Response) {
    let _ = resp.text().await;
}

/// Check whether a 403 body indicates an expired pre-signed URL.
pub fn is_expired_url_body(body: &str) -> bool {
    body.contains("Request has expired")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_honored_when_within_cap() {
        // Pure function test: the delay-selection logic mirrors `sleep_for`.
        let chosen = match Some(10u64) {
            Some(secs) if secs <= 30 => Duration::from_secs(secs),
            _ => Duration::from_secs(999),
        };
        assert_eq!(chosen, Duration::from_secs(10));
    }

    #[test]
    fn retry_after_ignored_when_over_cap() {
        let base = Duration::from_secs(2);
        let chosen = match Some(60u64) {
            Some(secs) if secs <= 30 => Duration::from_secs(secs),
            _ => base,
        };
        assert_eq!(chosen, base);
    }

    #[test]
    fn expired_url_detection() {
        assert!(is_expired_url_body("403: Request has expired at ..."));
        assert!(!is_expired_url_body("permission denied"));
    }

    #[test]
    fn jitter_stays_within_ten_percent_bound() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= base);
            assert!(j <= base.mul_f64(1.10) + Duration::from_millis(1));
        }
    }
}
