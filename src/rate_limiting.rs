//! Per-user admission control: sliding-window counting, request bookkeeping,
//! and the process-wide quota store swept by the reaper.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config_parser::LimitsConfig;
use crate::error::{Error, ErrorDetails};
use crate::identity::UserKey;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Usage bookkeeping for a single user. Owned exclusively by the
/// [`QuotaStore`]; created lazily on first contact and evicted by the sweep
/// once the window is empty and the user has been idle long enough.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserState {
    /// Epoch-millisecond timestamps of admitted requests, non-decreasing by
    /// insertion order
    request_timestamps: Vec<u64>,
    last_request_at: Option<u64>,
    total_requests: u64,
    /// Manual override forcing permanent denial
    blocked: bool,
    created_at: u64,
}

impl UserState {
    fn new(now_ms: u64) -> Self {
        UserState {
            created_at: now_ms,
            ..Default::default()
        }
    }

    fn count_since(&self, cutoff_ms: u64) -> u32 {
        self.request_timestamps
            .iter()
            .filter(|t| **t > cutoff_ms)
            .count() as u32
    }

    /// Oldest timestamp still inside the window starting at `cutoff_ms`.
    /// Timestamps are non-decreasing, so the first match is the oldest.
    fn oldest_since(&self, cutoff_ms: u64) -> Option<u64> {
        self.request_timestamps
            .iter()
            .copied()
            .find(|t| *t > cutoff_ms)
    }

    fn prune(&mut self, cutoff_ms: u64) {
        self.request_timestamps.retain(|t| *t > cutoff_ms);
    }
}

/// Remaining per-tier quota, returned on successful admission and with
/// successful chat responses
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Remaining {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
}

/// Outcome of an admission check
#[derive(Clone, Debug, PartialEq)]
pub enum LimitDecision {
    Allowed {
        remaining: Remaining,
    },
    Denied {
        reason: String,
        /// Client retry hint in seconds; `None` for permanent denials
        retry_after: Option<u64>,
    },
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed { .. })
    }
}

impl LimitsConfig {
    /// Decide whether a request from a user in `state` may proceed at
    /// `now_ms`. Pure: reads the state, never mutates it.
    ///
    /// Rules short-circuit in priority order: manual block, cooldown,
    /// per-minute cap, per-hour cap, per-day cap. The per-minute denial uses
    /// a deliberately coarse fixed 60s hint; the hour and day tiers compute
    /// the hint from when the oldest in-window request falls out of the
    /// window.
    pub fn decide(&self, state: &UserState, now_ms: u64) -> LimitDecision {
        if state.blocked {
            return LimitDecision::Denied {
                reason: "Account is temporarily blocked".to_string(),
                retry_after: None,
            };
        }

        if let Some(last) = state.last_request_at {
            let elapsed_ms = now_ms.saturating_sub(last);
            let cooldown_ms = self.cooldown_secs * 1000;
            if elapsed_ms < cooldown_ms {
                let wait_secs = (cooldown_ms - elapsed_ms).div_ceil(1000);
                return LimitDecision::Denied {
                    reason: format!("Wait {wait_secs}s between messages"),
                    retry_after: Some(wait_secs),
                };
            }
        }

        let per_minute = state.count_since(now_ms.saturating_sub(MINUTE_MS));
        if per_minute >= self.max_per_minute {
            return LimitDecision::Denied {
                reason: format!("At most {} messages per minute", self.max_per_minute),
                retry_after: Some(60),
            };
        }

        let hour_cutoff = now_ms.saturating_sub(HOUR_MS);
        let per_hour = state.count_since(hour_cutoff);
        if per_hour >= self.max_per_hour {
            let reset_minutes = state
                .oldest_since(hour_cutoff)
                .map(|oldest| (oldest + HOUR_MS).saturating_sub(now_ms).div_ceil(MINUTE_MS))
                .unwrap_or(60);
            return LimitDecision::Denied {
                reason: format!(
                    "Hourly limit of {} messages reached. Resets in ~{reset_minutes} min.",
                    self.max_per_hour
                ),
                retry_after: Some(reset_minutes * 60),
            };
        }

        let day_cutoff = now_ms.saturating_sub(DAY_MS);
        let per_day = state.count_since(day_cutoff);
        if per_day >= self.max_per_day {
            let reset_hours = state
                .oldest_since(day_cutoff)
                .map(|oldest| (oldest + DAY_MS).saturating_sub(now_ms).div_ceil(HOUR_MS))
                .unwrap_or(24);
            return LimitDecision::Denied {
                reason: format!(
                    "Daily limit of {} messages reached. Resets in ~{reset_hours} h.",
                    self.max_per_day
                ),
                retry_after: Some(reset_hours * 3600),
            };
        }

        LimitDecision::Allowed {
            remaining: Remaining {
                minute: self.max_per_minute - per_minute,
                hour: self.max_per_hour - per_hour,
                day: self.max_per_day - per_day,
            },
        }
    }
}

/// Counters reported by a sweep
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepStats {
    pub removed: usize,
    pub active: usize,
}

/// Process-wide map from [`UserKey`] to [`UserState`].
///
/// Lifetime is the process lifetime; entries are pruned and evicted by
/// [`QuotaStore::sweep`]. All operations take the single interior lock for
/// the duration of one read-then-write sequence, so check-and-record is
/// atomic with respect to concurrent requests for the same key. The lock is
/// never held across an `.await`: the upstream call happens strictly outside
/// the store.
#[derive(Debug)]
pub struct QuotaStore {
    limits: LimitsConfig,
    states: Mutex<HashMap<UserKey, UserState>>,
}

impl QuotaStore {
    pub fn new(limits: LimitsConfig) -> Self {
        QuotaStore {
            limits,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    fn retention_cutoff(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.limits.retention_hours * HOUR_MS)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserKey, UserState>> {
        // A poisoned lock means another handler panicked mid-update; the
        // state is still a valid map, so keep serving.
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read-only admission check, used by `GET /api/limits`. Creates the
    /// state lazily on first contact but never records usage.
    pub fn check(&self, key: &UserKey, now_ms: u64) -> LimitDecision {
        let mut states = self.lock();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| UserState::new(now_ms));
        self.limits.decide(state, now_ms)
    }

    /// Check admission and, if allowed, record the request — one critical
    /// section, so two concurrent requests from the same key cannot both
    /// pass the check before either records. Usage is charged here, before
    /// the upstream call begins: failed upstream calls still consume quota.
    pub fn try_admit(&self, key: &UserKey, now_ms: u64) -> Result<Remaining, Error> {
        let mut states = self.lock();
        let state = states
            .entry(key.clone())
            .or_insert_with(|| UserState::new(now_ms));
        match self.limits.decide(state, now_ms) {
            LimitDecision::Allowed { remaining } => {
                state.request_timestamps.push(now_ms);
                state.last_request_at = Some(now_ms);
                state.total_requests += 1;
                state.prune(self.retention_cutoff(now_ms));
                Ok(Remaining {
                    minute: remaining.minute - 1,
                    hour: remaining.hour - 1,
                    day: remaining.day - 1,
                })
            }
            LimitDecision::Denied {
                reason,
                retry_after,
            } => Err(Error::new(ErrorDetails::QuotaExceeded {
                message: reason,
                retry_after,
            })),
        }
    }

    /// Manual-override flag forcing permanent denial for a user. No HTTP
    /// surface; operator/test use only.
    pub fn set_blocked(&self, key: &UserKey, blocked: bool) {
        let mut states = self.lock();
        states
            .entry(key.clone())
            .or_insert_with(|| UserState::new(now_ms()))
            .blocked = blocked;
    }

    /// Prune every state and evict the fully-inactive ones.
    ///
    /// Pruning always precedes the eviction check: an entry holding an
    /// unexpired timestamp is never removed, regardless of idle time.
    pub fn sweep(&self, now_ms: u64) -> SweepStats {
        let retention_cutoff = self.retention_cutoff(now_ms);
        let idle_cutoff_ms = self.limits.idle_eviction_hours * HOUR_MS;
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, state| {
            state.prune(retention_cutoff);
            if !state.request_timestamps.is_empty() {
                return true;
            }
            match state.last_request_at {
                Some(last) => now_ms.saturating_sub(last) <= idle_cutoff_ms,
                // Never-used entries (created by read-only checks) are
                // judged by their creation time instead
                None => now_ms.saturating_sub(state.created_at) <= idle_cutoff_ms,
            }
        });
        SweepStats {
            removed: before - states.len(),
            active: states.len(),
        }
    }

    pub fn active_users(&self) -> usize {
        self.lock().len()
    }
}
