use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelId, FeePolicy};
use crate::config::DecisionConfig;

/// Normalized heuristic scores for one channel, each in `[0, 1]`.
///
/// These are computed elsewhere from channel and node telemetry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicScores {
    /// forwarding activity
    pub activity: f64,
    /// liquidity health
    pub liquidity: f64,
    /// fee competitiveness against peers on similar routes
    pub competitiveness: f64,
    /// earned fees relative to capital
    pub profitability: f64,
    /// peer uptime and HTLC success
    pub reliability: f64,
    /// peer reputation
    pub peer_quality: f64,
    /// centrality of the peer in the graph
    pub network_position: f64,
    /// fee earned per unit of liquidity moved
    pub fee_efficiency: f64,
}

impl HeuristicScores {
    /// All scores set to the same value
    pub fn uniform(score: f64) -> Self {
        HeuristicScores {
            activity: score,
            liquidity: score,
            competitiveness: score,
            profitability: score,
            reliability: score,
            peer_quality: score,
            network_position: score,
            fee_efficiency: score,
        }
    }

    fn clamped(&self) -> Self {
        let c = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        HeuristicScores {
            activity: c(self.activity),
            liquidity: c(self.liquidity),
            competitiveness: c(self.competitiveness),
            profitability: c(self.profitability),
            reliability: c(self.reliability),
            peer_quality: c(self.peer_quality),
            network_position: c(self.network_position),
            fee_efficiency: c(self.fee_efficiency),
        }
    }
}

/// Inputs for one channel evaluation
#[derive(Clone, Debug)]
pub struct EvaluationContext {
    /// the managed node
    pub node_id: String,
    /// the channel's heuristic scores
    pub scores: HeuristicScores,
}

/// The kind of action decided for a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    #[allow(missing_docs)]
    NoAction,
    #[allow(missing_docs)]
    IncreaseFees,
    #[allow(missing_docs)]
    DecreaseFees,
    #[allow(missing_docs)]
    Rebalance,
    #[allow(missing_docs)]
    CloseChannel,
}

impl Display for DecisionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionKind::NoAction => "NO_ACTION",
            DecisionKind::IncreaseFees => "INCREASE_FEES",
            DecisionKind::DecreaseFees => "DECREASE_FEES",
            DecisionKind::Rebalance => "REBALANCE",
            DecisionKind::CloseChannel => "CLOSE_CHANNEL",
        };
        f.write_str(s)
    }
}

/// Which way liquidity moves in a rebalance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceDirection {
    /// push local balance out to the remote side
    Outbound,
    /// pull balance in to the local side
    Inbound,
}

/// A proposed rebalance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRequest {
    /// amount to move, in satoshi
    pub amount_sat: u64,
    /// direction
    pub direction: RebalanceDirection,
    /// expected cost, in satoshi
    pub estimated_cost_sat: u64,
}

/// Parameters attached to a decision
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Suggestion {
    /// nothing to change
    None,
    /// apply a new policy
    Policy(FeePolicy),
    /// move liquidity
    Rebalance {
        /// local ratio the rebalance aims for
        target_ratio: f64,
        /// amount and direction
        request: RebalanceRequest,
    },
    /// close the channel
    Close,
}

/// The outcome of evaluating one channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// the channel
    pub channel_id: ChannelId,
    /// the weighted composite score
    pub composite_score: f64,
    /// the inputs, clamped to `[0, 1]`
    pub scores: HeuristicScores,
    /// the decision
    pub decision: DecisionKind,
    /// how sure the rule that fired is
    pub confidence: f64,
    /// human readable explanation
    pub reasoning: String,
    /// parameters for executing the decision
    pub suggestion: Suggestion,
}

const CLOSE_CONFIDENCE: f64 = 0.95;
const REBALANCE_CONFIDENCE: f64 = 0.85;
const INCREASE_CONFIDENCE: f64 = 0.75;
const DECREASE_CONFIDENCE: f64 = 0.70;
const NO_ACTION_CONFIDENCE: f64 = 0.80;

const HIGH_ACTIVITY: f64 = 0.7;
const HEALTHY_LIQUIDITY: f64 = 0.65;
const HIGH_LIQUIDITY: f64 = 0.7;
const LOW_COMPETITIVENESS: f64 = 0.4;
const LOW_ACTIVITY: f64 = 0.4;
const DECREASE_FACTOR: f64 = 0.8;

/// Maps heuristic scores to decisions.
///
/// Evaluation is a pure function of its inputs.
#[derive(Clone, Debug, Default)]
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    /// Create an engine
    pub fn new(config: DecisionConfig) -> Self {
        DecisionEngine { config }
    }

    /// The engine configuration
    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// The weighted composite of the scores, in `[0, 1]`
    pub fn composite(&self, scores: &HeuristicScores) -> f64 {
        let w = &self.config.weights;
        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }
        let s = scores.clamped();
        let sum = w.activity * s.activity
            + w.liquidity * s.liquidity
            + w.competitiveness * s.competitiveness
            + w.profitability * s.profitability
            + w.reliability * s.reliability
            + w.peer_quality * s.peer_quality
            + w.network_position * s.network_position
            + w.fee_efficiency * s.fee_efficiency;
        (sum / total).clamp(0.0, 1.0)
    }

    /// Decide what to do with a channel.  The first matching rule wins.
    pub fn evaluate(&self, channel: &Channel, context: &EvaluationContext) -> Evaluation {
        let c = &self.config;
        let scores = context.scores.clamped();
        let composite = self.composite(&scores);
        let ratio = channel.local_ratio();
        let current_rate = channel.policy.fee_rate_ppm;

        let (decision, confidence, reasoning, suggestion) = if composite < c.close_threshold
            && scores.activity < c.close_activity_max
        {
            (
                DecisionKind::CloseChannel,
                CLOSE_CONFIDENCE,
                format!(
                    "composite {:.3} below {:.2} with activity {:.3} below {:.2}",
                    composite, c.close_threshold, scores.activity, c.close_activity_max
                ),
                Suggestion::Close,
            )
        } else if ratio < c.rebalance_min || ratio > c.rebalance_max {
            let target_local = channel.capacity_sat as f64 * c.rebalance_target;
            let amount_sat = (channel.local_balance_sat as f64 - target_local).abs().round() as u64;
            let direction = if ratio > c.rebalance_target {
                RebalanceDirection::Outbound
            } else {
                RebalanceDirection::Inbound
            };
            (
                DecisionKind::Rebalance,
                REBALANCE_CONFIDENCE,
                format!(
                    "local ratio {:.3} outside [{:.2}, {:.2}], move {} sat {:?} toward {:.2}",
                    ratio, c.rebalance_min, c.rebalance_max, amount_sat, direction, c.rebalance_target
                ),
                Suggestion::Rebalance {
                    target_ratio: c.rebalance_target,
                    request: RebalanceRequest { amount_sat, direction, estimated_cost_sat: 0 },
                },
            )
        } else if (scores.activity > HIGH_ACTIVITY && scores.liquidity > HEALTHY_LIQUIDITY)
            || (composite > c.optimal_min && scores.liquidity > HIGH_LIQUIDITY)
        {
            let new_rate = current_rate
                .saturating_add(c.fee_increase_step_ppm)
                .min(current_rate.saturating_add(c.max_fee_increase_ppm));
            (
                DecisionKind::IncreaseFees,
                INCREASE_CONFIDENCE,
                format!(
                    "high demand (activity {:.3}, liquidity {:.3}, composite {:.3}), fee rate {} -> {}",
                    scores.activity, scores.liquidity, composite, current_rate, new_rate
                ),
                Suggestion::Policy(channel.policy.with_fee_rate(new_rate)),
            )
        } else if (scores.competitiveness < LOW_COMPETITIVENESS && scores.activity < LOW_ACTIVITY)
            || (composite >= c.increase_threshold && composite < c.decrease_threshold)
        {
            let reduced = (current_rate as f64 * DECREASE_FACTOR) as u64;
            let floor = (current_rate as f64 * c.max_decrease_pct) as u64;
            let new_rate = reduced.max(floor).max(1);
            (
                DecisionKind::DecreaseFees,
                DECREASE_CONFIDENCE,
                format!(
                    "weak demand (competitiveness {:.3}, activity {:.3}, composite {:.3}), fee rate {} -> {}",
                    scores.competitiveness, scores.activity, composite, current_rate, new_rate
                ),
                Suggestion::Policy(channel.policy.with_fee_rate(new_rate)),
            )
        } else {
            (
                DecisionKind::NoAction,
                NO_ACTION_CONFIDENCE,
                format!("composite {:.3} within acceptable range", composite),
                Suggestion::None,
            )
        };

        Evaluation {
            channel_id: channel.id.clone(),
            composite_score: composite,
            scores,
            decision,
            confidence,
            reasoning,
            suggestion,
        }
    }
}
