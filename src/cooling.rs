//! Per-user, per-action cooldowns.
//!
//! Stamps live in memory only and reset when the process restarts. Stamps
//! older than the longest cooldown can no longer block anything and are
//! swept out periodically.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::CoolingConfig;

/// Minimum time between sweeps of expired stamps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The rate-limited user actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Throw,
    Retrieve,
    Comment,
}

/// Result of a cooldown check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoolingVerdict {
    pub allowed: bool,
    /// Time left before the action is allowed again; zero when allowed.
    pub remaining: Duration,
}

impl CoolingVerdict {
    pub fn remaining_secs(&self) -> u64 {
        // Round up so "wait 0 seconds" is never shown while still blocked
        let ms = self.remaining.as_millis() as u64;
        ms.div_ceil(1000)
    }
}

pub struct CoolingGate {
    throw: Duration,
    retrieve: Duration,
    comment: Duration,
    stamps: Mutex<Stamps>,
}

struct Stamps {
    by_key: HashMap<(String, ActionKind), Instant>,
    last_sweep: Instant,
}

impl Stamps {
    /// Drop stamps older than `expiry`, at most once per [`SWEEP_INTERVAL`].
    fn sweep(&mut self, now: Instant, expiry: Duration) {
        if now.saturating_duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;
        self.by_key
            .retain(|_, stamped| now.saturating_duration_since(*stamped) < expiry);
    }
}

impl CoolingGate {
    pub fn new(config: &CoolingConfig) -> Self {
        Self {
            throw: Duration::from_millis(config.throw_ms),
            retrieve: Duration::from_millis(config.retrieve_ms),
            comment: Duration::from_millis(config.comment_ms),
            stamps: Mutex::new(Stamps {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn cooldown(&self, kind: ActionKind) -> Duration {
        match kind {
            ActionKind::Throw => self.throw,
            ActionKind::Retrieve => self.retrieve,
            ActionKind::Comment => self.comment,
        }
    }

    fn longest_cooldown(&self) -> Duration {
        self.throw.max(self.retrieve).max(self.comment)
    }

    pub fn check_and_stamp(&self, user_id: &str, kind: ActionKind) -> CoolingVerdict {
        self.check_and_stamp_at(user_id, kind, Instant::now())
    }

    /// Check the cooldown at `now`; the stamp only moves when the action is allowed.
    pub fn check_and_stamp_at(&self, user_id: &str, kind: ActionKind, now: Instant) -> CoolingVerdict {
        let cooldown = self.cooldown(kind);
        let mut stamps = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        stamps.sweep(now, self.longest_cooldown());
        let key = (user_id.to_string(), kind);

        if let Some(last) = stamps.by_key.get(&key) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < cooldown {
                return CoolingVerdict {
                    allowed: false,
                    remaining: cooldown - elapsed,
                };
            }
        }

        stamps.by_key.insert(key, now);
        CoolingVerdict {
            allowed: true,
            remaining: Duration::ZERO,
        }
    }
}
