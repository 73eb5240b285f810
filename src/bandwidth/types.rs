use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-direction bandwidth limits in bytes per second.
///
/// Zero means "no limit of its own": a personal config with a zero field
/// inherits that field from the system defaults, and a zero default means
/// unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Traffic flowing from the target host to the client, bytes/sec.
    #[serde(default)]
    pub inbound: u64,

    /// Traffic flowing from the client to the target host, bytes/sec.
    #[serde(default)]
    pub outbound: u64,
}

impl BandwidthConfig {
    pub const UNLIMITED: u64 = 0;

    pub fn is_unlimited(value: u64) -> bool {
        value == Self::UNLIMITED
    }

    /// Field-wise merge: an unlimited personal value inherits the default.
    pub fn merge_with_defaults(personal: BandwidthConfig, defaults: BandwidthConfig) -> Self {
        let select = |p: u64, d: u64| if Self::is_unlimited(p) { d } else { p };
        Self {
            inbound: select(personal.inbound, defaults.inbound),
            outbound: select(personal.outbound, defaults.outbound),
        }
    }
}

impl fmt::Display for BandwidthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |f: &mut fmt::Formatter<'_>, v: u64| {
            if BandwidthConfig::is_unlimited(v) {
                write!(f, "unlimited")
            } else {
                write!(f, "{}", v)
            }
        };
        write!(f, "in=")?;
        show(f, self.inbound)?;
        write!(f, ", out=")?;
        show(f, self.outbound)
    }
}

/// A bandwidth limit promoted for arithmetic: "unlimited" becomes the
/// maximum representable value, so subtraction of reservations can never
/// turn an unlimited channel into a throttled one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota(u64);

impl Quota {
    pub fn from_limit(limit: u64) -> Self {
        if BandwidthConfig::is_unlimited(limit) {
            Self(u64::MAX)
        } else {
            Self(limit)
        }
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_unlimited(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self(u64::MAX)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Traffic accounting for one direction of one channel within the current
/// turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionTraffic {
    /// Bytes allowed on this turn.
    pub quote: Quota,
    /// Bytes reserved by pending reads/writes but not yet consumed.
    pub reserved: u64,
    /// Bytes actually transferred on this turn.
    pub actual: u64,
    /// Turn this record belongs to.
    pub sequence_number: u64,
}

impl DirectionTraffic {
    /// Bytes still available for reservation on this turn.
    pub fn available(&self) -> u64 {
        self.quote
            .get()
            .saturating_sub(self.reserved.saturating_add(self.actual))
    }
}

/// Per-turn traffic state of one channel (the user-end and target-end
/// sockets of a connection group), plus the configured limits it follows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelLimits {
    /// Values coming from the configuration.
    pub directive: BandwidthConfig,

    /// Accounting for the user-end socket (bounded by `directive.outbound`).
    pub user_end: DirectionTraffic,

    /// Accounting for the target-end socket (bounded by `directive.inbound`).
    pub target_end: DirectionTraffic,
}

impl ChannelLimits {
    pub fn new(sequence_number: u64, directive: BandwidthConfig) -> Self {
        Self {
            directive,
            user_end: DirectionTraffic {
                quote: Quota::from_limit(directive.outbound),
                sequence_number,
                ..Default::default()
            },
            target_end: DirectionTraffic {
                quote: Quota::from_limit(directive.inbound),
                sequence_number,
                ..Default::default()
            },
        }
    }

    pub fn end(&self, end: ChannelEnd) -> &DirectionTraffic {
        match end {
            ChannelEnd::User => &self.user_end,
            ChannelEnd::Target => &self.target_end,
        }
    }

    pub fn end_mut(&mut self, end: ChannelEnd) -> &mut DirectionTraffic {
        match end {
            ChannelEnd::User => &mut self.user_end,
            ChannelEnd::Target => &mut self.target_end,
        }
    }
}

/// Which socket end of a channel an I/O operation is accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEnd {
    User,
    Target,
}

impl ChannelEnd {
    pub fn opposite(self) -> Self {
        match self {
            ChannelEnd::User => ChannelEnd::Target,
            ChannelEnd::Target => ChannelEnd::User,
        }
    }
}
