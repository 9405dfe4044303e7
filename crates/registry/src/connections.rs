//! Per-user connection slots: single-occupancy claims, handshake attempt
//! throttling, and duplicate rejection.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use {dashmap::DashMap, serde::Serialize};

use pulse_common::{SocketId, SocketSummary, UserId, ms_to_iso, now_ms};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// A pending claim older than this is treated as abandoned.
    pub handshake_deadline: Duration,
    /// Attempt-counting window.
    pub throttle_window: Duration,
    /// Attempts within the window at which throttling starts.
    pub throttle_max_attempts: u32,
    /// How long the throttled state outlives the last attempt.
    pub throttle_cooldown: Duration,
}

impl From<&pulse_config::Config> for ManagerConfig {
    fn from(cfg: &pulse_config::Config) -> Self {
        Self {
            handshake_deadline: Duration::from_millis(cfg.throttle.window_ms),
            throttle_window: Duration::from_millis(cfg.throttle.window_ms),
            throttle_max_attempts: cfg.throttle.max_attempts,
            throttle_cooldown: Duration::from_millis(cfg.throttle.cooldown_ms),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_deadline: Duration::from_secs(2),
            throttle_window: Duration::from_secs(2),
            throttle_max_attempts: 3,
            throttle_cooldown: Duration::from_secs(30),
        }
    }
}

// ── Slot state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum SlotState {
    /// Claimed, handshake still in flight.
    Pending { socket_id: SocketId, since: Instant },
    /// Handshake completed; the socket owns the slot.
    Active {
        socket_id: SocketId,
        connected_at_ms: u64,
    },
}

#[derive(Default)]
struct UserSlot {
    state: Option<SlotState>,
    attempts: Vec<Instant>,
    throttled_until: Option<Instant>,
}

/// Result of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed,
    Duplicate(SocketSummary),
    Throttled,
}

/// Admin/introspection view of a user slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub user_id: UserId,
    pub socket_id: SocketId,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub active: usize,
    pub pending: usize,
    pub throttled: usize,
    pub duplicates_rejected: u64,
    pub throttle_rejections: u64,
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Enforces at most one active socket per user.
///
/// Claims are atomic: the slot entry is mutated under its shard guard, so two
/// concurrent `try_claim` calls for the same user serialize and exactly one
/// wins an empty slot.
pub struct ConnectionManager {
    slots: DashMap<UserId, UserSlot>,
    config: ManagerConfig,
    duplicates_rejected: AtomicU64,
    throttle_rejections: AtomicU64,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
            duplicates_rejected: AtomicU64::new(0),
            throttle_rejections: AtomicU64::new(0),
        }
    }

    /// Claim the user's slot for a connecting socket.
    pub fn try_claim(&self, user_id: UserId, socket_id: &str) -> ClaimOutcome {
        self.try_claim_at(user_id, socket_id, Instant::now())
    }

    /// Claim with an explicit clock, for deterministic tests.
    pub fn try_claim_at(&self, user_id: UserId, socket_id: &str, now: Instant) -> ClaimOutcome {
        let mut slot = self.slots.entry(user_id).or_default();

        // Attempts during an active cooldown keep it alive.
        if let Some(until) = slot.throttled_until {
            if now < until {
                slot.throttled_until = Some(now + self.config.throttle_cooldown);
                self.throttle_rejections.fetch_add(1, Ordering::Relaxed);
                return ClaimOutcome::Throttled;
            }
            slot.throttled_until = None;
            slot.attempts.clear();
        }

        let window = self.config.throttle_window;
        slot.attempts.retain(|t| now.duration_since(*t) < window);
        slot.attempts.push(now);
        if slot.attempts.len() >= self.config.throttle_max_attempts as usize {
            slot.throttled_until = Some(now + self.config.throttle_cooldown);
            self.throttle_rejections.fetch_add(1, Ordering::Relaxed);
            return ClaimOutcome::Throttled;
        }

        match &slot.state {
            Some(SlotState::Active {
                socket_id: existing,
                connected_at_ms,
            }) => {
                let summary = SocketSummary {
                    socket_id: existing.clone(),
                    user_id,
                    connected_at: ms_to_iso(*connected_at_ms),
                };
                self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                ClaimOutcome::Duplicate(summary)
            },
            Some(SlotState::Pending { since, .. })
                if now.duration_since(*since) < self.config.handshake_deadline =>
            {
                // A newer attempt supersedes the in-flight handshake; the
                // stale one can no longer activate.
                slot.state = Some(SlotState::Pending {
                    socket_id: socket_id.to_string(),
                    since: now,
                });
                ClaimOutcome::Claimed
            },
            _ => {
                slot.state = Some(SlotState::Pending {
                    socket_id: socket_id.to_string(),
                    since: now,
                });
                ClaimOutcome::Claimed
            },
        }
    }

    /// Promote a pending claim to active. Returns false when the slot is no
    /// longer held by this socket (superseded or released meanwhile).
    pub fn activate(&self, user_id: UserId, socket_id: &str) -> bool {
        let Some(mut slot) = self.slots.get_mut(&user_id) else {
            return false;
        };
        match &slot.state {
            Some(SlotState::Pending {
                socket_id: pending, ..
            }) if pending == socket_id => {
                slot.state = Some(SlotState::Active {
                    socket_id: socket_id.to_string(),
                    connected_at_ms: now_ms(),
                });
                true
            },
            _ => false,
        }
    }

    /// Release the slot if it is held by this socket; a no-op otherwise,
    /// which protects against out-of-order disconnect callbacks.
    pub fn release(&self, user_id: UserId, socket_id: &str) {
        if let Some(mut slot) = self.slots.get_mut(&user_id) {
            let held_by_socket = matches!(
                &slot.state,
                Some(SlotState::Active { socket_id: s, .. } | SlotState::Pending { socket_id: s, .. })
                    if s == socket_id
            );
            if held_by_socket {
                slot.state = None;
            }
        }
        self.slots.remove_if(&user_id, |_, slot| {
            slot.state.is_none() && slot.attempts.is_empty() && slot.throttled_until.is_none()
        });
    }

    /// The user's active socket, if a handshake has completed.
    #[must_use]
    pub fn active_socket(&self, user_id: UserId) -> Option<SocketId> {
        self.slots.get(&user_id).and_then(|slot| match &slot.state {
            Some(SlotState::Active { socket_id, .. }) => Some(socket_id.clone()),
            _ => None,
        })
    }

    #[must_use]
    pub fn info(&self, user_id: UserId) -> Option<SlotInfo> {
        self.slots.get(&user_id).and_then(|slot| match &slot.state {
            Some(SlotState::Active {
                socket_id,
                connected_at_ms,
            }) => Some(SlotInfo {
                user_id,
                socket_id: socket_id.clone(),
                state: "active",
                connected_at: Some(ms_to_iso(*connected_at_ms)),
            }),
            Some(SlotState::Pending { socket_id, .. }) => Some(SlotInfo {
                user_id,
                socket_id: socket_id.clone(),
                state: "pending",
                connected_at: None,
            }),
            None => None,
        })
    }

    /// Forget a user's throttle state (admin).
    pub fn clear_throttle(&self, user_id: UserId) {
        if let Some(mut slot) = self.slots.get_mut(&user_id) {
            slot.attempts.clear();
            slot.throttled_until = None;
        }
        self.slots.remove_if(&user_id, |_, slot| {
            slot.state.is_none() && slot.attempts.is_empty() && slot.throttled_until.is_none()
        });
    }

    /// Drop every slot (admin reset).
    pub fn clear_all(&self) {
        self.slots.clear();
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.stats_at(Instant::now())
    }

    #[must_use]
    pub fn stats_at(&self, now: Instant) -> ManagerStats {
        let mut active = 0;
        let mut pending = 0;
        let mut throttled = 0;
        for slot in self.slots.iter() {
            match &slot.state {
                Some(SlotState::Active { .. }) => active += 1,
                Some(SlotState::Pending { .. }) => pending += 1,
                None => {},
            }
            if slot.throttled_until.is_some_and(|until| now < until) {
                throttled += 1;
            }
        }
        ManagerStats {
            active,
            pending,
            throttled,
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            throttle_rejections: self.throttle_rejections.load(Ordering::Relaxed),
        }
    }
}
