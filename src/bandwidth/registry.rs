use super::manager::BandwidthManager;
use super::types::{BandwidthConfig, ChannelEnd, ChannelLimits};
use dashmap::DashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

struct UserEntry {
    state: Mutex<BandwidthManager>,
    turn: Notify,
    connections: AtomicUsize,
}

impl UserEntry {
    fn new(personal_limits: BandwidthConfig, defaults: BandwidthConfig) -> Self {
        Self {
            state: Mutex::new(BandwidthManager::new(personal_limits, defaults)),
            turn: Notify::new(),
            connections: AtomicUsize::new(0),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BandwidthManager> {
        // A poisoned lock means a turn recompute panicked; the counters are
        // still usable, so keep going instead of spreading the panic.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of per-user bandwidth managers plus the one-second turn driver.
///
/// A manager appears on the first authenticated connection of a user and is
/// dropped together with the user's last connection.
pub struct BandwidthRegistry {
    users: DashMap<u64, Arc<UserEntry>>,
    defaults: RwLock<BandwidthConfig>,
    shutdown: CancellationToken,
}

impl BandwidthRegistry {
    pub fn new(defaults: BandwidthConfig) -> Arc<Self> {
        Arc::new(Self {
            users: DashMap::new(),
            defaults: RwLock::new(defaults),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the one-second turn broadcast.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = ticker.tick() => registry.run_turn(),
                }
            }
            trace!("bandwidth ticker stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Recompute every user's counters for a new turn and wake the
    /// directions parked on quota exhaustion.
    ///
    /// A fault inside one user's recompute is logged and swallowed: losing
    /// one turn is preferable to losing the ticker.
    pub fn run_turn(&self) {
        for entry in self.users.iter() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                entry
                    .value()
                    .lock_state()
                    .update_traffic_counters_for_new_turn();
            }));
            if outcome.is_err() {
                error!(user_id = *entry.key(), "turn recompute panicked; skipping this turn");
            }
            entry.value().turn.notify_waiters();
        }
    }

    /// Install new system-wide default limits. Every live manager re-merges
    /// its personal directive against them; quotas change on the next turn.
    pub fn update_default_limits(&self, defaults: BandwidthConfig) {
        *self
            .defaults
            .write()
            .unwrap_or_else(|e| e.into_inner()) = defaults;
        for entry in self.users.iter() {
            entry.value().lock_state().update_default_limits(defaults);
        }
    }

    pub fn default_limits(&self) -> BandwidthConfig {
        *self.defaults.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a new connection of `user_id` and obtain its traffic limiter.
    ///
    /// `domain_limits` carries the per-site limit matched during
    /// authentication, when the connection names its target by domain.
    pub fn limiter(
        self: &Arc<Self>,
        user_id: u64,
        personal_limits: BandwidthConfig,
        domain_limits: Option<(String, BandwidthConfig)>,
    ) -> TrafficLimiter {
        let defaults = self.default_limits();

        let entry = {
            let slot = self
                .users
                .entry(user_id)
                .or_insert_with(|| Arc::new(UserEntry::new(personal_limits, defaults)));
            slot.value().connections.fetch_add(1, Ordering::SeqCst);
            Arc::clone(slot.value())
        };

        {
            let mut state = entry.lock_state();
            state.update_personal_limits(personal_limits, defaults);
            if let Some((domain, limits)) = &domain_limits {
                state.make_domain_limits(domain, *limits);
            }
        }

        TrafficLimiter {
            registry: Arc::clone(self),
            user_id,
            entry,
            domain: domain_limits.map(|(domain, _)| domain),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Current aggregate channel state of a user, when the user is live.
    pub fn general_traffic_of(&self, user_id: u64) -> Option<ChannelLimits> {
        self.users
            .get(&user_id)
            .map(|entry| *entry.value().lock_state().general_traffic())
    }
}

/// Handle tying one connection to its user's bandwidth manager.
///
/// Reservations and commits go to the user's aggregate channel and, when the
/// connection targets a limited domain, to that domain's entry as well. The
/// handle detaches the connection (and its domain entry) on drop.
pub struct TrafficLimiter {
    registry: Arc<BandwidthRegistry>,
    user_id: u64,
    entry: Arc<UserEntry>,
    domain: Option<String>,
}

impl TrafficLimiter {
    /// Reserve up to `max` bytes on `end` for the current turn.
    ///
    /// Returns the number of bytes actually reserved; zero means the turn's
    /// allowance is exhausted and the caller should `wait_next_turn`.
    pub fn try_reserve(&self, end: ChannelEnd, max: u64) -> u64 {
        let mut state = self.entry.lock_state();

        let mut allowed = state.general_traffic().end(end).available().min(max);
        if let Some(domain) = &self.domain {
            if let Some(entry) = state.domain_traffic(domain) {
                allowed = allowed.min(entry.traffic.end(end).available());
            }
        }

        if allowed == 0 {
            return 0;
        }

        let dir = state.general_traffic_mut().end_mut(end);
        dir.reserved = dir.reserved.saturating_add(allowed);
        if let Some(domain) = self.domain.clone() {
            if let Some(entry) = state.domain_traffic_mut(&domain) {
                let dir = entry.traffic.end_mut(end);
                dir.reserved = dir.reserved.saturating_add(allowed);
            }
        }

        allowed
    }

    /// Release a reservation made by `try_reserve` and record the bytes that
    /// actually went through.
    ///
    /// The turn boundary zeroes `reserved` on its own, so a commit landing
    /// after a turn change simply adds its `actual` bytes to the new turn
    /// (which is exactly the over-consumption the carry rule accounts for).
    pub fn commit(&self, end: ChannelEnd, reserved: u64, actual: u64) {
        let mut state = self.entry.lock_state();

        let dir = state.general_traffic_mut().end_mut(end);
        dir.reserved = dir.reserved.saturating_sub(reserved);
        dir.actual = dir.actual.saturating_add(actual);

        if let Some(domain) = self.domain.clone() {
            if let Some(entry) = state.domain_traffic_mut(&domain) {
                let dir = entry.traffic.end_mut(end);
                dir.reserved = dir.reserved.saturating_sub(reserved);
                dir.actual = dir.actual.saturating_add(actual);
            }
        }
    }

    /// Park until the next turn starts.
    pub async fn wait_next_turn(&self) {
        self.entry.turn.notified().await;
    }

    /// Copy of the user's aggregate channel state (tests and diagnostics).
    pub fn general_traffic(&self) -> ChannelLimits {
        *self.entry.lock_state().general_traffic()
    }
}

impl Drop for TrafficLimiter {
    fn drop(&mut self) {
        if let Some(domain) = &self.domain {
            self.entry.lock_state().connection_removed(domain);
        }

        let previous = self.entry.connections.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            // Last connection of the user: retire the manager unless a new
            // connection attached in the meantime.
            self.registry
                .users
                .remove_if(&self.user_id, |_, entry| {
                    entry.connections.load(Ordering::SeqCst) == 0
                });
        }
    }
}
