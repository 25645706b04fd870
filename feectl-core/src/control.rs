use futures::stream::{self, StreamExt};
use tracing::*;

use crate::backup::BackupManager;
use crate::channel::{Channel, ChannelId};
use crate::config::{ConfigError, ControlConfig};
use crate::decision::{DecisionEngine, DecisionKind, Evaluation, EvaluationContext, HeuristicScores, Suggestion};
use crate::executor::{BatchOutcome, PolicyChange, PolicyExecutor};
use crate::node::{NodeApi, Notifier};
use crate::persist::{self, Store};
use crate::policy::error::ValidationError;
use crate::policy::validator::{ChangeType, PolicyValidator, ProposedChange};
use crate::rollback::RollbackOrchestrator;
use crate::transaction::{TransactionError, TransactionManager};
use crate::util::clock::Clock;
use crate::Arc;

/// One channel to evaluate
#[derive(Clone, Debug)]
pub struct CycleInput {
    /// the channel snapshot
    pub channel: Channel,
    /// its heuristic scores
    pub scores: HeuristicScores,
}

/// A decision that is reported rather than executed
#[derive(Clone, Debug, PartialEq)]
pub struct Advisory {
    #[allow(missing_docs)]
    pub channel_id: ChannelId,
    #[allow(missing_docs)]
    pub decision: DecisionKind,
    #[allow(missing_docs)]
    pub reasoning: String,
    /// why the validator would refuse it
    pub rejected: Option<ValidationError>,
}

/// What one decision cycle did
#[derive(Debug)]
pub struct CycleReport {
    /// every evaluation, in input order
    pub evaluations: Vec<Evaluation>,
    /// fee changes not executed for lack of confidence
    pub low_confidence: Vec<ChannelId>,
    /// rebalance and close recommendations
    pub advisories: Vec<Advisory>,
    /// the executed fee changes, absent when there were none
    pub batch: Option<BatchOutcome>,
}

/// The assembled control plane
pub struct ControlPlane {
    config: ControlConfig,
    engine: DecisionEngine,
    validator: Arc<PolicyValidator>,
    backups: Arc<BackupManager>,
    executor: Arc<PolicyExecutor>,
    transactions: Arc<TransactionManager>,
    rollback: Arc<RollbackOrchestrator>,
}

impl ControlPlane {
    /// Build every component from the configuration
    pub fn new(
        config: ControlConfig,
        store: Arc<dyn Store>,
        client: Arc<dyn NodeApi>,
        notifier: Option<Arc<dyn Notifier>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.check()?;
        let engine = DecisionEngine::new(config.decision.clone());
        let validator = Arc::new(PolicyValidator::with_store(
            config.validator.clone(),
            Arc::clone(&clock),
            Arc::clone(&store),
        ));
        let backups =
            Arc::new(BackupManager::new(config.backup.clone(), Arc::clone(&store), Arc::clone(&clock)));
        let executor =
            Arc::new(PolicyExecutor::new(config.executor.clone(), Arc::clone(&validator), client));
        let transactions = Arc::new(TransactionManager::new(
            config.transaction.clone(),
            store,
            Arc::clone(&backups),
            Arc::clone(&executor),
            clock,
        ));
        let rollback = Arc::new(RollbackOrchestrator::new(
            config.rollback.clone(),
            Arc::clone(&transactions),
            Arc::clone(&backups),
            notifier,
        ));
        if config.executor.dry_run {
            info!("shadow mode: no change will reach the node");
        }
        Ok(ControlPlane { config, engine, validator, backups, executor, transactions, rollback })
    }

    /// Reload state kept across restarts
    pub fn load_history(&self) -> Result<usize, persist::Error> {
        self.validator.load_history()
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &ControlConfig {
        &self.config
    }
    #[allow(missing_docs)]
    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }
    #[allow(missing_docs)]
    pub fn validator(&self) -> &Arc<PolicyValidator> {
        &self.validator
    }
    #[allow(missing_docs)]
    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }
    #[allow(missing_docs)]
    pub fn executor(&self) -> &Arc<PolicyExecutor> {
        &self.executor
    }
    #[allow(missing_docs)]
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }
    #[allow(missing_docs)]
    pub fn rollback(&self) -> &Arc<RollbackOrchestrator> {
        &self.rollback
    }

    /// Evaluate every channel and execute the confident fee changes as one batch
    #[instrument(skip(self, inputs), fields(channels = inputs.len()))]
    pub async fn run_cycle(
        &self,
        node_id: &str,
        inputs: Vec<CycleInput>,
    ) -> Result<CycleReport, TransactionError> {
        let engine = &self.engine;
        let evaluated: Vec<(Channel, Evaluation)> = stream::iter(inputs)
            .map(|input| async move {
                let context = EvaluationContext { node_id: node_id.to_string(), scores: input.scores };
                let evaluation = engine.evaluate(&input.channel, &context);
                (input.channel, evaluation)
            })
            .buffered(self.config.executor.max_concurrency.max(1))
            .collect()
            .await;

        let min_confidence = self.config.decision.min_confidence;
        let mut changes = Vec::new();
        let mut low_confidence = Vec::new();
        let mut advisories = Vec::new();
        for (channel, evaluation) in &evaluated {
            debug!("{}: {} ({:.2}) {}", channel.id, evaluation.decision, evaluation.confidence, evaluation.reasoning);
            match (&evaluation.decision, &evaluation.suggestion) {
                (DecisionKind::IncreaseFees | DecisionKind::DecreaseFees, Suggestion::Policy(policy)) => {
                    if evaluation.confidence < min_confidence {
                        low_confidence.push(channel.id.clone());
                        continue;
                    }
                    let change_type = if evaluation.decision == DecisionKind::IncreaseFees {
                        ChangeType::FeeIncrease
                    } else {
                        ChangeType::FeeDecrease
                    };
                    changes.push(PolicyChange { channel: channel.clone(), policy: policy.clone(), change_type });
                }
                (DecisionKind::Rebalance, Suggestion::Rebalance { request, .. }) => {
                    let change = ProposedChange::Rebalance(request.clone());
                    advisories.push(Advisory {
                        channel_id: channel.id.clone(),
                        decision: evaluation.decision,
                        reasoning: evaluation.reasoning.clone(),
                        rejected: self.validator.validate(channel, &change).err(),
                    });
                }
                (DecisionKind::CloseChannel, _) => advisories.push(Advisory {
                    channel_id: channel.id.clone(),
                    decision: evaluation.decision,
                    reasoning: evaluation.reasoning.clone(),
                    rejected: None,
                }),
                _ => {}
            }
        }

        let batch = if changes.is_empty() {
            None
        } else {
            Some(self.executor.batch_apply(&self.transactions, node_id, changes, false).await?)
        };
        info!(
            "cycle on {}: {} evaluated, {} advisories, {} low confidence",
            node_id,
            evaluated.len(),
            advisories.len(),
            low_confidence.len()
        );
        let evaluations = evaluated.into_iter().map(|(_, e)| e).collect();
        Ok(CycleReport { evaluations, low_confidence, advisories, batch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::persist::memory::MemoryStore;
    use crate::transaction::TransactionStatus;
    use crate::util::clock::ManualClock;
    use crate::util::test_utils::{increase_scores, make_channel, make_policy, MockNodeClient};
    use test_log::test;

    fn plane(config: ControlConfig) -> (ControlPlane, Arc<MockNodeClient>) {
        let client = Arc::new(MockNodeClient::new());
        let plane = ControlPlane::new(
            config,
            Arc::new(MemoryStore::new()),
            client.clone(),
            None,
            Arc::new(ManualClock::from_secs(1_700_000_000)),
        )
        .unwrap();
        (plane, client)
    }

    fn inputs(client: &MockNodeClient) -> Vec<CycleInput> {
        let hot = make_channel("hot", 10_000_000, 5_000_000, 5_000_000, make_policy(1000, 500));
        let skewed = make_channel("skewed", 10_000_000, 9_500_000, 500_000, make_policy(1000, 500));
        let idle = make_channel("idle", 10_000_000, 5_000_000, 5_000_000, make_policy(1000, 500));
        for c in [&hot, &skewed, &idle] {
            client.add_channel(c.clone());
        }
        vec![
            CycleInput { channel: hot, scores: increase_scores() },
            CycleInput { channel: skewed, scores: HeuristicScores::uniform(0.5) },
            CycleInput { channel: idle, scores: HeuristicScores::uniform(0.6) },
        ]
    }

    fn fast() -> ControlConfig {
        let mut config = ControlConfig::default();
        config.executor = ExecutorConfig { base_delay_ms: 1, ..Default::default() };
        config
    }

    #[test(tokio::test)]
    async fn cycle_applies_confident_changes() {
        let (plane, client) = plane(fast());
        let report = plane.run_cycle("node", inputs(&client)).await.unwrap();
        let decisions: Vec<_> = report.evaluations.iter().map(|e| e.decision).collect();
        assert_eq!(
            decisions,
            vec![DecisionKind::IncreaseFees, DecisionKind::Rebalance, DecisionKind::NoAction]
        );
        let batch = report.batch.unwrap();
        assert_eq!(batch.status(), Some(TransactionStatus::Success));
        assert_eq!(client.policy_of(&hex_ref("hot")), Some(make_policy(1000, 700)));
        assert_eq!(report.advisories.len(), 1);
        assert_eq!(report.advisories[0].decision, DecisionKind::Rebalance);
        assert!(report.advisories[0].rejected.is_none());
        // rebalances are never executed
        assert_eq!(client.calls().len(), 1);
    }

    #[test(tokio::test)]
    async fn low_confidence_is_not_executed() {
        let mut config = fast();
        config.decision.min_confidence = 0.8;
        let (plane, client) = plane(config);
        let report = plane.run_cycle("node", inputs(&client)).await.unwrap();
        assert_eq!(report.low_confidence, vec![ChannelId::new("hot")]);
        assert!(report.batch.is_none());
        assert!(client.calls().is_empty());
    }

    #[test(tokio::test)]
    async fn shadow_mode_touches_nothing() {
        let mut config = fast();
        config.executor.dry_run = true;
        let (plane, client) = plane(config);
        let report = plane.run_cycle("node", inputs(&client)).await.unwrap();
        let batch = report.batch.unwrap();
        assert!(batch.transaction.is_none());
        let (_, result) = &batch.results[0];
        assert!(result.as_ref().unwrap().dry_run);
        assert!(client.calls().is_empty());
        assert!(plane.transactions().list(None, 10).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_config() {
        let mut config = ControlConfig::default();
        config.backup.warm_days = 1;
        let result = ControlPlane::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MockNodeClient::new()),
            None,
            Arc::new(ManualClock::from_secs(0)),
        );
        assert!(result.is_err());
    }

    fn hex_ref(id: &str) -> String {
        format!("{}:0", hex::encode(id))
    }
}
