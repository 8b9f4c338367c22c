//! Request screening in front of verification and settlement.
//!
//! Three independent gates, checked in this order: the emergency pause, access
//! control on the payer, and a per-key rate limit. Shared counters live in a
//! [`DashMap`] and are updated through its entry API, so a check and its increment
//! are one step.
//!
//! The admin routes that drive the pause are gated separately by a bearer
//! [`AdminToken`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use x402_types::config::LiteralOrEnv;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("Service paused: {0}")]
    Paused(String),
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Payer {0} is not allowed")]
    Forbidden(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "security_defaults::enabled")]
    pub enabled: bool,
    #[serde(default = "security_defaults::requests_per_minute")]
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: security_defaults::enabled(),
            requests_per_minute: security_defaults::requests_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlConfig {
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

/// Bearer token of the admin routes, literal or `$ENV` reference.
///
/// ```json
/// { "adminToken": "$ADMIN_TOKEN" }
/// ```
#[derive(Clone, Deserialize)]
pub struct AdminToken(LiteralOrEnv<String>);

impl AdminToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(LiteralOrEnv::from_literal(token.into()))
    }

    /// Compares digests so timing reveals neither content nor length.
    pub fn matches(&self, presented: &str) -> bool {
        let expected = Sha256::digest(self.0.inner().as_bytes());
        let presented = Sha256::digest(presented.as_bytes());
        expected.ct_eq(&presented).into()
    }
}

impl fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminToken(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub access_control: AccessControlConfig,
    /// `ADMIN_TOKEN` when unset. Without a token the admin routes refuse every request.
    #[serde(default = "security_defaults::admin_token", skip_serializing)]
    pub admin_token: Option<AdminToken>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            access_control: AccessControlConfig::default(),
            admin_token: security_defaults::admin_token(),
        }
    }
}

mod security_defaults {
    use super::AdminToken;

    pub fn enabled() -> bool {
        true
    }

    pub fn requests_per_minute() -> u32 {
        60
    }

    pub fn admin_token() -> Option<AdminToken> {
        std::env::var("ADMIN_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
            .map(AdminToken::new)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter per key.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_window(config, RATE_LIMIT_WINDOW)
    }

    pub fn with_window(config: &RateLimitConfig, window: Duration) -> Self {
        Self {
            enabled: config.enabled,
            limit: config.requests_per_minute,
            window,
            windows: DashMap::new(),
        }
    }

    /// Counts one request for `key`, refusing it once the window is full.
    pub fn check(&self, key: &str) -> Result<(), GuardError> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), GuardError> {
        if !self.enabled {
            return Ok(());
        }
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        let mut elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
            elapsed = Duration::ZERO;
        }
        if entry.count >= self.limit {
            let retry_after = self.window.saturating_sub(elapsed);
            return Err(GuardError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }
        entry.count += 1;
        Ok(())
    }

    /// Drops windows that ended; returns how many.
    pub fn purge_stale(&self) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.started.elapsed() < self.window);
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseStatus {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

/// Operator kill switch for verification and settlement.
#[derive(Debug, Default)]
pub struct EmergencyPause {
    state: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl EmergencyPause {
    pub fn activate(&self, reason: impl Into<String>) -> PauseStatus {
        let reason = reason.into();
        tracing::warn!(reason = %reason, "Emergency pause activated");
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        *state = Some((reason, Utc::now()));
        Self::status_of(&state)
    }

    pub fn deactivate(&self) -> PauseStatus {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if state.take().is_some() {
            tracing::warn!("Emergency pause lifted");
        }
        Self::status_of(&state)
    }

    pub fn status(&self) -> PauseStatus {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        Self::status_of(&state)
    }

    fn status_of(state: &Option<(String, DateTime<Utc>)>) -> PauseStatus {
        match state {
            Some((reason, at)) => PauseStatus {
                active: true,
                reason: Some(reason.clone()),
                activated_at: Some(*at),
            },
            None => PauseStatus {
                active: false,
                reason: None,
                activated_at: None,
            },
        }
    }

    pub fn check(&self) -> Result<(), GuardError> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        match state.as_ref() {
            Some((reason, _)) => Err(GuardError::Paused(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Payer allow and deny lists. An empty whitelist admits everyone not blacklisted.
#[derive(Debug, Default)]
pub struct AccessControl {
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

impl AccessControl {
    pub fn new(config: &AccessControlConfig) -> Self {
        Self {
            whitelist: config.whitelist.iter().cloned().collect(),
            blacklist: config.blacklist.iter().cloned().collect(),
        }
    }

    pub fn check(&self, payer: &str) -> Result<(), GuardError> {
        if self.blacklist.contains(payer) {
            return Err(GuardError::Forbidden(payer.to_string()));
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(payer) {
            return Err(GuardError::Forbidden(payer.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStatus {
    pub pause: PauseStatus,
    pub rate_limit_entries: usize,
    pub rate_limit_enabled: bool,
}

#[derive(Debug)]
pub struct SecurityGuard {
    pub rate_limiter: RateLimiter,
    pub pause: EmergencyPause,
    pub access: AccessControl,
    admin_token: Option<AdminToken>,
}

impl SecurityGuard {
    pub fn new(config: &SecurityConfig) -> Self {
        if config.admin_token.is_none() {
            tracing::warn!("No admin token configured, admin routes are locked");
        }
        Self {
            rate_limiter: RateLimiter::new(&config.rate_limit),
            pause: EmergencyPause::default(),
            access: AccessControl::new(&config.access_control),
            admin_token: config.admin_token.clone(),
        }
    }

    /// Whether `bearer` is the configured admin token. Always false without one.
    pub fn admin_authorized(&self, bearer: Option<&str>) -> bool {
        match (&self.admin_token, bearer) {
            (Some(token), Some(bearer)) => token.matches(bearer),
            _ => false,
        }
    }

    /// Screens a request from `rate_key`, paying as `payer` when known.
    pub fn check(&self, rate_key: &str, payer: Option<&str>) -> Result<(), GuardError> {
        self.pause.check()?;
        if let Some(payer) = payer {
            self.access.check(payer)?;
        }
        self.rate_limiter.check(rate_key)
    }

    pub fn status(&self) -> SecurityStatus {
        SecurityStatus {
            pause: self.pause.status(),
            rate_limit_entries: self.rate_limiter.len(),
            rate_limit_enabled: self.rate_limiter.enabled,
        }
    }

    /// Purges stale rate-limit windows every minute until `cancel` fires.
    pub async fn run_maintenance(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(RATE_LIMIT_WINDOW);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let purged = self.rate_limiter.purge_stale();
                    if purged > 0 {
                        tracing::debug!(purged, "Purged stale rate-limit windows");
                    }
                }
            }
        }
    }
}
