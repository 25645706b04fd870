use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;

use crate::channel::{Channel, ChannelId, FeePolicy};
use crate::config::{Bounds, ValidatorConfig};
use crate::decision::{RebalanceDirection, RebalanceRequest};
use crate::persist::{self, from_document, Document, Filter, Store};
use crate::policy::error::{PolicyField, ValidationError, ValidationErrorKind};
use crate::policy::history::ChangeHistory;
use crate::prelude::*;
use crate::Arc;
use crate::util::clock::Clock;

/// The collection change histories are persisted in
pub const HISTORY_COLLECTION: &str = "change_history";

/// Why a policy is being changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// raise the fee rate
    FeeIncrease,
    /// lower the fee rate
    FeeDecrease,
    /// operator requested
    Manual,
    /// put back a backed up policy
    Restore,
}

/// A change to be checked by [`PolicyValidator::validate`]
#[derive(Clone, Debug, PartialEq)]
pub enum ProposedChange {
    /// replace the channel policy
    Policy {
        /// the new policy
        policy: FeePolicy,
        /// the reason for the change
        change_type: ChangeType,
    },
    /// move liquidity
    Rebalance(RebalanceRequest),
}

#[derive(Serialize, Deserialize)]
struct HistoryRecord {
    #[serde(rename = "_id")]
    channel_id: ChannelId,
    #[serde(flatten)]
    history: ChangeHistory,
}

/// The safety gate every change passes before reaching the node.
///
/// The only mutable state is the per-channel change history.  Callers that
/// validate and then apply must hold [`PolicyValidator::channel_lock`] across
/// both steps, so that concurrent attempts on the same channel cannot both
/// pass the cooldown check.
pub struct PolicyValidator {
    config: ValidatorConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn Store>>,
    history: Mutex<OrderedMap<ChannelId, ChangeHistory>>,
    locks: Mutex<OrderedMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PolicyValidator {
    /// Create a validator with an in-memory history
    pub fn new(config: ValidatorConfig, clock: Arc<dyn Clock>) -> Self {
        PolicyValidator {
            config,
            clock,
            store: None,
            history: Mutex::new(OrderedMap::new()),
            locks: Mutex::new(OrderedMap::new()),
        }
    }

    /// Create a validator that persists the change history
    pub fn with_store(config: ValidatorConfig, clock: Arc<dyn Clock>, store: Arc<dyn Store>) -> Self {
        PolicyValidator { store: Some(store), ..Self::new(config, clock) }
    }

    /// The validator configuration
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// The lock serializing changes to one channel
    pub fn channel_lock(&self, channel_id: &ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(channel_id.clone()).or_default().clone()
    }

    /// Check a proposed change against every rule, stopping at the first violation
    pub fn validate(&self, channel: &Channel, change: &ProposedChange) -> Result<(), ValidationError> {
        let fail = |kind| {
            let err = ValidationError::new(channel.id.clone(), kind);
            debug!("validation failed: {}", err);
            Err(err)
        };

        if self.config.blacklist.contains(&channel.id) {
            return fail(ValidationErrorKind::Blacklisted);
        }

        if let ProposedChange::Policy { policy, .. } = change {
            let current = &channel.policy;
            let c = &self.config;
            let checks = [
                (PolicyField::BaseFee, policy.base_fee_msat, &c.base_fee_msat),
                (PolicyField::FeeRate, policy.fee_rate_ppm, &c.fee_rate_ppm),
                (PolicyField::TimeLockDelta, policy.time_lock_delta as u64, &c.time_lock_delta),
            ];
            for (field, value, bounds) in checks {
                if let Some(kind) = out_of_bounds(field, value, bounds) {
                    return fail(kind);
                }
            }

            let magnitudes = [
                (PolicyField::BaseFee, current.base_fee_msat, policy.base_fee_msat),
                (PolicyField::FeeRate, current.fee_rate_ppm, policy.fee_rate_ppm),
            ];
            for (field, current, proposed) in magnitudes {
                if let Some(kind) = excessive_change(field, current, proposed, c.max_change_percent)
                {
                    return fail(kind);
                }
            }
        }

        if let Some(kind) = self.check_rate(&channel.id) {
            return fail(kind);
        }

        if let ProposedChange::Rebalance(request) = change {
            if let Some(msg) = self.check_rebalance(channel, request) {
                return fail(ValidationErrorKind::Rebalance(msg));
            }
        }

        debug!("validation passed for {}", channel.id);
        Ok(())
    }

    fn check_rate(&self, channel_id: &ChannelId) -> Option<ValidationErrorKind> {
        let now = self.clock.now_secs();
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let entry = history.get(channel_id)?;
        let count = entry.count_in_window(now);
        if count >= self.config.max_changes_per_day {
            return Some(ValidationErrorKind::RateLimited {
                count,
                limit: self.config.max_changes_per_day,
            });
        }
        let cooldown = self.config.cooldown().as_secs();
        let elapsed = now.saturating_sub(entry.last()?);
        if elapsed < cooldown {
            return Some(ValidationErrorKind::Cooldown { remaining_secs: cooldown - elapsed });
        }
        None
    }

    fn check_rebalance(&self, channel: &Channel, request: &RebalanceRequest) -> Option<String> {
        let limits = &self.config.rebalance;
        let amount = request.amount_sat;
        if amount < limits.min_amount_sat {
            return Some(format!("amount {} below minimum {}", amount, limits.min_amount_sat));
        }
        let max_amount = (channel.capacity_sat as f64 * limits.max_amount_percent) as u64;
        if amount > max_amount {
            return Some(format!("amount {} above {} of capacity", amount, max_amount));
        }
        let max_cost = amount as f64 * limits.max_cost_percent;
        if request.estimated_cost_sat as f64 > max_cost {
            return Some(format!(
                "cost {} above {:.0} allowed for amount {}",
                request.estimated_cost_sat, max_cost, amount
            ));
        }
        let (side, available) = match request.direction {
            RebalanceDirection::Outbound => ("local", channel.local_balance_sat),
            RebalanceDirection::Inbound => ("remote", channel.remote_balance_sat),
        };
        if available < amount {
            return Some(format!("{} balance {} below amount {}", side, available, amount));
        }
        None
    }

    /// Record a successful change to a channel.
    ///
    /// The in-memory history is always updated.  A persistence failure is
    /// returned so the caller can report it.
    pub fn record_change(&self, channel_id: &ChannelId) -> Result<(), persist::Error> {
        let now = self.clock.now_secs();
        let snapshot = {
            let mut history = self.history.lock().map_err(persist::poisoned)?;
            let entry = history.entry(channel_id.clone()).or_default();
            entry.insert(now);
            entry.clone()
        };
        debug!("recorded change to {} at {}", channel_id, now);
        if let Some(store) = &self.store {
            let mut set = Document::new();
            set.insert("timestamps".to_string(), json!(snapshot.timestamps));
            store.update_one(HISTORY_COLLECTION, &Filter::by_id(channel_id.as_str()), set, true)?;
        }
        Ok(())
    }

    /// Reload change histories from the store, returning how many channels were loaded
    pub fn load_history(&self) -> Result<usize, persist::Error> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(0),
        };
        let now = self.clock.now_secs();
        let docs = store.find(HISTORY_COLLECTION, &Filter::all(), None, None)?;
        let mut history = self.history.lock().map_err(persist::poisoned)?;
        let mut loaded = 0;
        for doc in docs {
            let record: HistoryRecord = from_document(doc)?;
            let mut entry = ChangeHistory::load_from_state(record.history.timestamps);
            entry.prune(now);
            if !entry.is_empty() {
                history.insert(record.channel_id, entry);
                loaded += 1;
            }
        }
        info!("loaded change history for {} channels", loaded);
        Ok(loaded)
    }

    /// Changes recorded for a channel within the rolling day
    pub fn changes_in_window(&self, channel_id: &ChannelId) -> usize {
        let now = self.clock.now_secs();
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.get(channel_id).map(|h| h.count_in_window(now)).unwrap_or(0)
    }
}

fn out_of_bounds(field: PolicyField, value: u64, bounds: &Bounds) -> Option<ValidationErrorKind> {
    if bounds.contains(value) {
        return None;
    }
    Some(ValidationErrorKind::OutOfBounds { field, value, min: bounds.min, max: bounds.max })
}

fn excessive_change(
    field: PolicyField,
    current: u64,
    proposed: u64,
    max_change: f64,
) -> Option<ValidationErrorKind> {
    // no relative limit from zero
    if current == 0 {
        return None;
    }
    let change = (proposed as f64 - current as f64).abs() / current as f64;
    if change <= max_change {
        return None;
    }
    Some(ValidationErrorKind::ExcessiveChange { field, current, proposed, change, max_change })
}
