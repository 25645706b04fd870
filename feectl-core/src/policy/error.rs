use ValidationErrorKind::*;

use crate::channel::ChannelId;

/// The policy field a limit applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyField {
    #[allow(missing_docs)]
    BaseFee,
    #[allow(missing_docs)]
    FeeRate,
    #[allow(missing_docs)]
    TimeLockDelta,
}

impl PolicyField {
    /// The field name
    pub fn name(&self) -> &'static str {
        match self {
            PolicyField::BaseFee => "base_fee_msat",
            PolicyField::FeeRate => "fee_rate_ppm",
            PolicyField::TimeLockDelta => "time_lock_delta",
        }
    }
}

/// Kind of validation error
#[derive(Clone, Debug, PartialEq)]
pub enum ValidationErrorKind {
    /// The channel is on the blacklist
    Blacklisted,
    /// A policy value is outside the configured bounds
    OutOfBounds {
        /// the offending field
        field: PolicyField,
        /// proposed value
        value: u64,
        /// lower bound
        min: u64,
        /// upper bound
        max: u64,
    },
    /// A policy value changes by more than the allowed fraction
    ExcessiveChange {
        /// the offending field
        field: PolicyField,
        /// current value
        current: u64,
        /// proposed value
        proposed: u64,
        /// relative change
        change: f64,
        /// allowed relative change
        max_change: f64,
    },
    /// Too many changes within the rolling day
    RateLimited {
        /// changes recorded in the window
        count: usize,
        /// allowed changes in the window
        limit: usize,
    },
    /// The channel was changed too recently
    Cooldown {
        /// seconds until the next change is allowed
        remaining_secs: u64,
    },
    /// A rebalance request violates a limit
    Rebalance(String),
}

/// Validation error
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationError {
    /// The channel that failed validation
    pub channel_id: ChannelId,
    /// The kind of error
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    /// Create a validation error
    pub fn new(channel_id: ChannelId, kind: ValidationErrorKind) -> Self {
        ValidationError { channel_id, kind }
    }

    /// A stable, machine checkable reason
    pub fn reason(&self) -> &'static str {
        match self.kind {
            Blacklisted => "blacklisted",
            OutOfBounds { .. } => "out_of_bounds",
            ExcessiveChange { .. } => "excessive_change",
            RateLimited { .. } => "rate_limited",
            Cooldown { .. } => "cooldown",
            Rebalance(_) => "rebalance_limit",
        }
    }

    /// A human readable description
    pub fn message(&self) -> String {
        match &self.kind {
            Blacklisted => "channel is blacklisted".to_string(),
            OutOfBounds { field, value, min, max } =>
                format!("{} {} outside [{}, {}]", field.name(), value, min, max),
            ExcessiveChange { field, current, proposed, change, max_change } => format!(
                "{} change {} -> {} is {:.1}%, above {:.1}%",
                field.name(),
                current,
                proposed,
                change * 100.0,
                max_change * 100.0
            ),
            RateLimited { count, limit } =>
                format!("{} changes in the last 24h, limit {}", count, limit),
            Cooldown { remaining_secs } => format!("cooldown active for {}s", remaining_secs),
            Rebalance(msg) => format!("rebalance: {}", msg),
        }
    }
}

impl core::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}: {}", self.channel_id, self.message())
    }
}

impl std::error::Error for ValidationError {}

impl Into<String> for ValidationError {
    fn into(self) -> String {
        format!("{}: {}", self.reason(), self.message())
    }
}
