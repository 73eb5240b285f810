use super::types::{BandwidthConfig, ChannelLimits, DirectionTraffic, Quota};
use std::collections::HashMap;
use std::time::Instant;

/// Traffic state for one destination domain of one user.
#[derive(Debug, Clone)]
pub struct DomainTraffic {
    /// How many live connections currently talk to this domain.
    pub connection_count: usize,

    /// Per-turn traffic accounting for this domain.
    pub traffic: ChannelLimits,
}

/// Bandwidth limit manager for all connections of a single user.
///
/// Not synchronized: callers serialize access (the registry wraps each
/// manager in a mutex and mutates it from the owning side only).
#[derive(Debug)]
pub struct BandwidthManager {
    /// Raw personal limits as configured. Kept so that a later change of the
    /// system defaults can be re-merged.
    directive_personal_limits: BandwidthConfig,

    /// Effective limits: personal merged with the system defaults.
    general_limits: BandwidthConfig,

    /// Aggregate traffic over all connections of the user.
    general_traffic: ChannelLimits,

    /// Per-domain traffic entries.
    domain_traffic: HashMap<String, DomainTraffic>,

    /// Turn counter.
    sequence_number: u64,

    /// When the counters were last recomputed.
    last_update_at: Instant,
}

impl BandwidthManager {
    pub fn new(personal_limits: BandwidthConfig, default_limits: BandwidthConfig) -> Self {
        let general_limits =
            BandwidthConfig::merge_with_defaults(personal_limits, default_limits);
        let sequence_number = 0;

        Self {
            directive_personal_limits: personal_limits,
            general_limits,
            general_traffic: ChannelLimits::new(sequence_number, general_limits),
            domain_traffic: HashMap::new(),
            sequence_number,
            last_update_at: Instant::now(),
        }
    }

    /// Called on every successful authentication of the user: the personal
    /// limits may have changed in the user list. The current turn keeps its
    /// quotas; the new values apply from the next turn on.
    pub fn update_personal_limits(
        &mut self,
        personal_limits: BandwidthConfig,
        default_limits: BandwidthConfig,
    ) {
        self.directive_personal_limits = personal_limits;
        self.general_limits =
            BandwidthConfig::merge_with_defaults(personal_limits, default_limits);
        self.general_traffic.directive = self.general_limits;
    }

    /// Called when the system-wide defaults change. Same deferred semantics
    /// as `update_personal_limits`.
    pub fn update_default_limits(&mut self, default_limits: BandwidthConfig) {
        self.general_limits = BandwidthConfig::merge_with_defaults(
            self.directive_personal_limits,
            default_limits,
        );
        self.general_traffic.directive = self.general_limits;
    }

    pub fn general_traffic(&self) -> &ChannelLimits {
        &self.general_traffic
    }

    pub fn general_traffic_mut(&mut self) -> &mut ChannelLimits {
        &mut self.general_traffic
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn general_limits(&self) -> BandwidthConfig {
        self.general_limits
    }

    /// Register one more connection talking to `domain`.
    ///
    /// Creates the entry with a connection count of 1 when absent; otherwise
    /// increments the count and refreshes the directive values (the limits
    /// may have changed in the user list since the entry was created).
    pub fn make_domain_limits(&mut self, domain: &str, limits: BandwidthConfig) {
        match self.domain_traffic.get_mut(domain) {
            Some(entry) => {
                entry.connection_count += 1;
                entry.traffic.directive = limits;
            }
            None => {
                self.domain_traffic.insert(
                    domain.to_string(),
                    DomainTraffic {
                        connection_count: 1,
                        traffic: ChannelLimits::new(self.sequence_number, limits),
                    },
                );
            }
        }
    }

    /// Unregister one connection from `domain`; drops the entry when the
    /// count reaches zero.
    pub fn connection_removed(&mut self, domain: &str) {
        if let Some(entry) = self.domain_traffic.get_mut(domain) {
            entry.connection_count = entry.connection_count.saturating_sub(1);
            if entry.connection_count == 0 {
                self.domain_traffic.remove(domain);
            }
        }
    }

    pub fn domain_traffic(&self, domain: &str) -> Option<&DomainTraffic> {
        self.domain_traffic.get(domain)
    }

    pub fn domain_traffic_mut(&mut self, domain: &str) -> Option<&mut DomainTraffic> {
        self.domain_traffic.get_mut(domain)
    }

    pub fn domain_count(&self) -> usize {
        self.domain_traffic.len()
    }

    /// Recompute every channel for a new turn.
    ///
    /// The tick may arrive with jitter, so the previous turn's quota is
    /// scaled by the elapsed wall-clock interval before the carry check:
    /// bytes transferred beyond the scaled quota stay in `actual` and eat
    /// into the new turn's allowance.
    pub fn update_traffic_counters_for_new_turn(&mut self) {
        let update_at = Instant::now();
        let elapsed_ms = update_at.duration_since(self.last_update_at).as_millis() as f64;
        let multiplier = elapsed_ms / 1000.0;
        self.last_update_at = update_at;

        self.sequence_number += 1;
        let sequence_number = self.sequence_number;

        let turn_direction = |dir: &mut DirectionTraffic, new_quote: u64| {
            dir.sequence_number = sequence_number;

            let old_quote = (dir.quote.get() as f64 * multiplier + 0.5) as u64;

            if dir.actual <= old_quote {
                dir.actual = 0;
            } else {
                // Over-consumption on the previous turn: the excess is
                // carried and deducted from this turn's allowance. When the
                // excess exceeds the whole quota the turn is skipped.
                dir.actual -= old_quote;
            }

            dir.quote = Quota::from_limit(new_quote);
            dir.reserved = 0;
        };

        let turn_channel = |channel: &mut ChannelLimits| {
            turn_direction(&mut channel.user_end, channel.directive.outbound);
            turn_direction(&mut channel.target_end, channel.directive.inbound);
        };

        turn_channel(&mut self.general_traffic);
        for entry in self.domain_traffic.values_mut() {
            turn_channel(&mut entry.traffic);
        }
    }
}
