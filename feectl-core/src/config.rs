use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

/// An inclusive range of allowed values
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// smallest allowed value
    pub min: u64,
    /// largest allowed value
    pub max: u64,
}

impl Bounds {
    /// Create bounds
    pub const fn new(min: u64, max: u64) -> Self {
        Bounds { min, max }
    }

    /// Whether the value is inside the bounds
    pub fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Relative weight of each heuristic in the composite score
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    #[allow(missing_docs)]
    pub activity: f64,
    #[allow(missing_docs)]
    pub liquidity: f64,
    #[allow(missing_docs)]
    pub competitiveness: f64,
    #[allow(missing_docs)]
    pub profitability: f64,
    #[allow(missing_docs)]
    pub reliability: f64,
    #[allow(missing_docs)]
    pub peer_quality: f64,
    #[allow(missing_docs)]
    pub network_position: f64,
    #[allow(missing_docs)]
    pub fee_efficiency: f64,
}

impl ScoreWeights {
    /// Sum of all weights
    pub fn total(&self) -> f64 {
        self.activity
            + self.liquidity
            + self.competitiveness
            + self.profitability
            + self.reliability
            + self.peer_quality
            + self.network_position
            + self.fee_efficiency
    }

    fn all(&self) -> [f64; 8] {
        [
            self.activity,
            self.liquidity,
            self.competitiveness,
            self.profitability,
            self.reliability,
            self.peer_quality,
            self.network_position,
            self.fee_efficiency,
        ]
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            activity: 0.20,
            liquidity: 0.15,
            competitiveness: 0.15,
            profitability: 0.15,
            reliability: 0.10,
            peer_quality: 0.10,
            network_position: 0.10,
            fee_efficiency: 0.05,
        }
    }
}

/// Thresholds of the decision rules
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// heuristic weights
    pub weights: ScoreWeights,
    /// composite below which a channel is a close candidate
    pub close_threshold: f64,
    /// activity below which a close candidate is closed
    pub close_activity_max: f64,
    /// lowest healthy local balance ratio
    pub rebalance_min: f64,
    /// highest healthy local balance ratio
    pub rebalance_max: f64,
    /// local balance ratio a rebalance aims for
    pub rebalance_target: f64,
    /// composite above which a channel is performing optimally
    pub optimal_min: f64,
    /// lower edge of the composite band that triggers a decrease
    pub increase_threshold: f64,
    /// upper edge (exclusive) of the composite band that triggers a decrease
    pub decrease_threshold: f64,
    /// step of a fee increase, in ppm
    pub fee_increase_step_ppm: u64,
    /// cap on a single fee increase, in ppm
    pub max_fee_increase_ppm: u64,
    /// floor of a fee decrease, as a fraction of the current rate
    pub max_decrease_pct: f64,
    /// proposals below this confidence are not executed by the decision cycle
    pub min_confidence: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        DecisionConfig {
            weights: ScoreWeights::default(),
            close_threshold: 0.1,
            close_activity_max: 0.15,
            rebalance_min: 0.2,
            rebalance_max: 0.8,
            rebalance_target: 0.5,
            optimal_min: 0.7,
            increase_threshold: 0.3,
            decrease_threshold: 0.5,
            fee_increase_step_ppm: 200,
            max_fee_increase_ppm: 500,
            max_decrease_pct: 0.5,
            min_confidence: 0.7,
        }
    }
}

/// Limits for rebalance proposals
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceLimits {
    /// smallest rebalance worth doing
    pub min_amount_sat: u64,
    /// largest rebalance, as a fraction of the capacity
    pub max_amount_percent: f64,
    /// largest acceptable cost, as a fraction of the amount
    pub max_cost_percent: f64,
}

impl Default for RebalanceLimits {
    fn default() -> Self {
        RebalanceLimits { min_amount_sat: 10_000, max_amount_percent: 0.8, max_cost_percent: 0.01 }
    }
}

/// Safety limits enforced before any change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// allowed base fee, msat
    pub base_fee_msat: Bounds,
    /// allowed fee rate, ppm
    pub fee_rate_ppm: Bounds,
    /// allowed CLTV delta
    pub time_lock_delta: Bounds,
    /// largest relative change of base fee or fee rate in one step
    pub max_change_percent: f64,
    /// changes allowed per channel per rolling day
    pub max_changes_per_day: usize,
    /// minimum time between changes to the same channel
    pub cooldown_minutes: u64,
    /// channels which must never be changed
    pub blacklist: Vec<ChannelId>,
    /// rebalance limits
    pub rebalance: RebalanceLimits,
}

impl ValidatorConfig {
    /// The cooldown as a duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            base_fee_msat: Bounds::new(0, 10_000),
            fee_rate_ppm: Bounds::new(1, 5_000),
            time_lock_delta: Bounds::new(18, 2016),
            max_change_percent: 0.5,
            max_changes_per_day: 3,
            cooldown_minutes: 60,
            blacklist: Vec::new(),
            rebalance: RebalanceLimits::default(),
        }
    }
}

/// How policy changes are pushed to the remote node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// shadow mode - simulate changes without calling the node
    pub dry_run: bool,
    /// attempts per remote call
    pub max_attempts: u32,
    /// first backoff delay; attempt `n` waits `base_delay * 2^n`
    pub base_delay_ms: u64,
    /// bound on a single remote call
    pub call_timeout_secs: u64,
    /// read the policy back after applying it
    pub verify: bool,
    /// channels processed at the same time
    pub max_concurrency: usize,
}

impl ExecutorConfig {
    /// The first backoff delay
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// The bound on a single remote call
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            dry_run: false,
            max_attempts: 3,
            base_delay_ms: 1000,
            call_timeout_secs: 30,
            verify: true,
            max_concurrency: 4,
        }
    }
}

/// Age limits of the backup tiers, in days since creation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// age at which a hot backup moves to warm
    pub hot_days: u64,
    /// age at which a warm backup moves to cold
    pub warm_days: u64,
    /// age at which a cold backup is deleted
    pub cold_days: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig { hot_days: 7, warm_days: 30, cold_days: 90 }
    }
}

/// Triggers for automatic rollback
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// error rate at or above which a change is rolled back
    pub error_rate_threshold: f64,
    /// latency ratio (after / before) at or above which a change is rolled back
    pub latency_ratio_threshold: f64,
    /// samples needed before metrics are trusted
    pub min_samples: u32,
    /// default monitoring window
    pub monitor_duration_secs: u64,
    /// default polling interval
    pub monitor_interval_secs: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        RollbackConfig {
            error_rate_threshold: 0.5,
            latency_ratio_threshold: 2.0,
            min_samples: 3,
            monitor_duration_secs: 3600,
            monitor_interval_secs: 60,
        }
    }
}

/// What to do with the successful channels of a partially failed batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialPolicy {
    /// leave the successful changes in place
    Keep,
    /// roll the whole transaction back
    Revert,
}

/// Transaction handling
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// handling of PARTIAL commits
    pub partial_policy: PartialPolicy,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig { partial_policy: PartialPolicy::Keep }
    }
}

/// The complete control plane configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    #[allow(missing_docs)]
    pub decision: DecisionConfig,
    #[allow(missing_docs)]
    pub validator: ValidatorConfig,
    #[allow(missing_docs)]
    pub executor: ExecutorConfig,
    #[allow(missing_docs)]
    pub backup: BackupConfig,
    #[allow(missing_docs)]
    pub rollback: RollbackConfig,
    #[allow(missing_docs)]
    pub transaction: TransactionConfig,
}

/// An inconsistent configuration
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

fn fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError(format!("{} must be within [0, 1], got {}", name, value)));
    }
    Ok(())
}

fn bounds(name: &str, b: &Bounds) -> Result<(), ConfigError> {
    if b.min > b.max {
        return Err(ConfigError(format!("{} min {} above max {}", name, b.min, b.max)));
    }
    Ok(())
}

impl ControlConfig {
    /// Reject inconsistent values
    pub fn check(&self) -> Result<(), ConfigError> {
        let d = &self.decision;
        if d.weights.all().iter().any(|w| *w < 0.0) || d.weights.total() <= 0.0 {
            return Err(ConfigError("weights must be non-negative with a positive sum".into()));
        }
        fraction("close_threshold", d.close_threshold)?;
        fraction("rebalance_target", d.rebalance_target)?;
        fraction("max_decrease_pct", d.max_decrease_pct)?;
        fraction("min_confidence", d.min_confidence)?;
        if !(d.rebalance_min <= d.rebalance_target && d.rebalance_target <= d.rebalance_max) {
            return Err(ConfigError("rebalance band must contain the target".into()));
        }
        if d.increase_threshold > d.decrease_threshold {
            return Err(ConfigError("increase_threshold above decrease_threshold".into()));
        }

        let v = &self.validator;
        bounds("base_fee_msat", &v.base_fee_msat)?;
        bounds("fee_rate_ppm", &v.fee_rate_ppm)?;
        bounds("time_lock_delta", &v.time_lock_delta)?;
        if v.max_change_percent <= 0.0 {
            return Err(ConfigError("max_change_percent must be positive".into()));
        }
        if v.max_changes_per_day == 0 {
            return Err(ConfigError("max_changes_per_day must be positive".into()));
        }
        fraction("rebalance.max_amount_percent", v.rebalance.max_amount_percent)?;
        fraction("rebalance.max_cost_percent", v.rebalance.max_cost_percent)?;

        let e = &self.executor;
        if e.max_attempts == 0 || e.max_concurrency == 0 || e.call_timeout_secs == 0 {
            return Err(ConfigError(
                "max_attempts, max_concurrency and call_timeout_secs must be positive".into(),
            ));
        }

        let b = &self.backup;
        if !(b.hot_days < b.warm_days && b.warm_days < b.cold_days) {
            return Err(ConfigError("retention windows must be increasing".into()));
        }

        let r = &self.rollback;
        if r.monitor_interval_secs == 0 {
            return Err(ConfigError("monitor_interval_secs must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = ControlConfig::default();
        config.check().unwrap();
        assert!((config.decision.weights.total() - 1.0).abs() < 1e-9);
        assert_eq!(config.validator.cooldown(), Duration::from_secs(3600));
    }

    #[test]
    fn partial_documents_use_defaults() {
        let config: ControlConfig = serde_json::from_str(
            r#"{"validator": {"cooldown_minutes": 5}, "transaction": {"partial_policy": "revert"}}"#,
        )
        .unwrap();
        assert_eq!(config.validator.cooldown_minutes, 5);
        assert_eq!(config.validator.max_changes_per_day, 3);
        assert_eq!(config.transaction.partial_policy, PartialPolicy::Revert);
        assert_eq!(config.backup, BackupConfig::default());
    }

    #[test]
    fn rejects_inconsistent_values() {
        let mut config = ControlConfig::default();
        config.validator.fee_rate_ppm = Bounds::new(10, 1);
        assert!(config.check().is_err());

        let mut config = ControlConfig::default();
        config.backup.warm_days = 3;
        assert!(config.check().is_err());

        let mut config = ControlConfig::default();
        config.decision.weights = ScoreWeights {
            activity: 0.0,
            liquidity: 0.0,
            competitiveness: 0.0,
            profitability: 0.0,
            reliability: 0.0,
            peer_quality: 0.0,
            network_position: 0.0,
            fee_efficiency: 0.0,
        };
        assert!(config.check().is_err());
    }
}
