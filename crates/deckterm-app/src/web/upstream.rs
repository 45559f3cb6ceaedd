//! Reverse proxy to the companion service, guarded by a circuit breaker

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
};
use deckterm_types::{Owner, TerminalError};
use tracing::{debug, info, warn};

use super::error::AppError;
use crate::config::{IdentityConfig, UpstreamConfig};

/// Breaker state as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    /// One probe request is allowed through
    HalfOpen { probe_started: Instant },
}

/// Fails calls fast after `threshold` consecutive failures, then lets a
/// single probe through once more than `reset_timeout` has passed
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_timeout,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn before_call(&self) -> Result<(), Duration> {
        self.before_call_at(Instant::now())
    }

    /// Ask to make a call; `Err` carries how long to wait before retrying
    pub fn before_call_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since } => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed > self.reset_timeout {
                    info!("upstream circuit half-open, sending probe");
                    *state = BreakerState::HalfOpen { probe_started: now };
                    Ok(())
                } else {
                    Err((self.reset_timeout - elapsed).max(Duration::from_millis(1)))
                }
            }
            BreakerState::HalfOpen { probe_started } => {
                // A probe that never reported back must not wedge the breaker
                let elapsed = now.saturating_duration_since(probe_started);
                if elapsed > self.reset_timeout {
                    *state = BreakerState::HalfOpen { probe_started: now };
                    Ok(())
                } else {
                    Err((self.reset_timeout - elapsed).max(Duration::from_millis(1)))
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut state = self.lock();
        if !matches!(*state, BreakerState::Closed { failures: 0 }) {
            if matches!(*state, BreakerState::HalfOpen { .. }) {
                info!("upstream circuit closed");
            }
            *state = BreakerState::Closed { failures: 0 };
        }
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now())
    }

    pub fn on_failure_at(&self, now: Instant) {
        let mut state = self.lock();
        *state = match *state {
            BreakerState::Closed { failures } if failures + 1 >= self.threshold => {
                warn!(failures = failures + 1, "upstream circuit opened");
                BreakerState::Open { since: now }
            }
            BreakerState::Closed { failures } => BreakerState::Closed {
                failures: failures + 1,
            },
            BreakerState::HalfOpen { .. } => {
                warn!("upstream probe failed, circuit reopened");
                BreakerState::Open { since: now }
            }
            // A late failure from a call admitted before the circuit opened
            open @ BreakerState::Open { .. } => open,
        };
    }
}

/// Forwards requests under `/upstream` to the companion service
#[derive(Debug)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    base_url: String,
    identity: IdentityConfig,
    breaker: CircuitBreaker,
}

impl UpstreamProxy {
    /// `identity` names the headers that carry the caller to the companion service
    pub fn new(config: &UpstreamConfig, identity: IdentityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            identity,
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_reset),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Forward one request; transport errors and 5xx answers count as failures
    pub async fn forward(
        &self,
        owner: &Owner,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, AppError> {
        self.breaker
            .before_call()
            .map_err(|retry_after| TerminalError::UpstreamUnavailable { retry_after })?;

        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        debug!(method = %method, url = %url, "proxying upstream");

        let mut request = self
            .client
            .request(method, &url)
            .header(self.identity.user_id_header.as_str(), owner.id.as_str())
            .header(self.identity.user_email_header.as_str(), owner.email.as_str());
        if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
            request = request.header(header::CONTENT_TYPE, content_type.clone());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.on_failure();
                warn!(url = %url, error = %e, "upstream request failed");
                return Err(AppError::BadGateway(format!("Upstream request failed: {}", e)));
            }
        };

        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.breaker.on_failure();
                return Err(AppError::BadGateway(format!("Upstream response failed: {}", e)));
            }
        };

        if status.is_server_error() {
            self.breaker.on_failure();
        } else {
            self.breaker.on_success();
        }

        let mut response = (status, bytes).into_response();
        if let Some(content_type) = content_type {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        Ok(response)
    }
}
