use core::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A channel identifier, as known to the control plane
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel id
    pub fn new(id: impl Into<String>) -> Self {
        ChannelId(id.into())
    }

    /// The string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId::new(s)
    }
}

/// The routing policy a node advertises for one of its channels
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Fixed fee per forwarded HTLC, in millisatoshi
    pub base_fee_msat: u64,
    /// Proportional fee, in parts per million
    pub fee_rate_ppm: u64,
    /// CLTV delta required on forwarded HTLCs
    pub time_lock_delta: u32,
    /// Smallest HTLC forwarded, in millisatoshi
    pub min_htlc_msat: u64,
    /// Largest HTLC forwarded, in millisatoshi, if limited
    pub max_htlc_msat: Option<u64>,
}

impl FeePolicy {
    /// A copy of this policy with a different fee rate
    pub fn with_fee_rate(&self, fee_rate_ppm: u64) -> Self {
        FeePolicy { fee_rate_ppm, ..self.clone() }
    }

    /// The canonical byte form, used for checksums
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // struct fields serialize in declaration order, so this is stable
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Check internal consistency
    pub fn check(&self) -> Result<(), ModelError> {
        if let Some(max) = self.max_htlc_msat {
            if max < self.min_htlc_msat {
                return Err(ModelError::HtlcRange { min: self.min_htlc_msat, max });
            }
        }
        Ok(())
    }
}

/// Malformed channel input, rejected at the boundary
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Balances exceed the capacity of the channel
    #[error("balances {local} + {remote} exceed capacity {capacity}")]
    BalanceExceedsCapacity {
        /// channel capacity
        capacity: u64,
        /// local balance
        local: u64,
        /// remote balance
        remote: u64,
    },
    /// The channel has no capacity
    #[error("zero capacity")]
    ZeroCapacity,
    /// The HTLC limits are inverted
    #[error("min htlc {min} above max htlc {max}")]
    HtlcRange {
        /// minimum
        min: u64,
        /// maximum
        max: u64,
    },
    /// An identifier is empty
    #[error("empty {0}")]
    Empty(&'static str),
}

/// A snapshot of a channel, fetched once per evaluation cycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Our identifier for the channel
    pub id: ChannelId,
    /// The remote peer's node id
    pub remote_pubkey: String,
    /// The token the remote API uses to address this channel (the channel point for LND)
    pub channel_ref: String,
    /// Capacity in satoshi
    pub capacity_sat: u64,
    /// Local balance in satoshi
    pub local_balance_sat: u64,
    /// Remote balance in satoshi
    pub remote_balance_sat: u64,
    /// The current policy
    pub policy: FeePolicy,
}

impl Channel {
    /// Create a channel snapshot, rejecting inconsistent input
    pub fn new(
        id: ChannelId,
        remote_pubkey: impl Into<String>,
        channel_ref: impl Into<String>,
        capacity_sat: u64,
        local_balance_sat: u64,
        remote_balance_sat: u64,
        policy: FeePolicy,
    ) -> Result<Self, ModelError> {
        let channel = Channel {
            id,
            remote_pubkey: remote_pubkey.into(),
            channel_ref: channel_ref.into(),
            capacity_sat,
            local_balance_sat,
            remote_balance_sat,
            policy,
        };
        channel.check()?;
        Ok(channel)
    }

    /// Check internal consistency
    pub fn check(&self) -> Result<(), ModelError> {
        if self.id.as_str().is_empty() {
            return Err(ModelError::Empty("channel id"));
        }
        if self.channel_ref.is_empty() {
            return Err(ModelError::Empty("channel reference"));
        }
        if self.capacity_sat == 0 {
            return Err(ModelError::ZeroCapacity);
        }
        if self.local_balance_sat.saturating_add(self.remote_balance_sat) > self.capacity_sat {
            return Err(ModelError::BalanceExceedsCapacity {
                capacity: self.capacity_sat,
                local: self.local_balance_sat,
                remote: self.remote_balance_sat,
            });
        }
        self.policy.check()
    }

    /// The share of the capacity on our side
    pub fn local_ratio(&self) -> f64 {
        if self.capacity_sat == 0 {
            return 0.0;
        }
        self.local_balance_sat as f64 / self.capacity_sat as f64
    }
}
