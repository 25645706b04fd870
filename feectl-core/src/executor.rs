use backoff::{Error as BackoffError, ExponentialBackoff, ExponentialBackoffBuilder};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::*;

use crate::channel::{Channel, ChannelId, FeePolicy};
use crate::config::{ExecutorConfig, PartialPolicy};
use crate::node::{ClientError, NodeApi};
use crate::policy::error::ValidationError;
use crate::policy::validator::{ChangeType, PolicyValidator, ProposedChange};
use crate::transaction::{
    OperationType, Progress, RollbackReport, Transaction, TransactionError, TransactionManager,
    TransactionStatus,
};
use crate::Arc;

/// The reason a rollback of a partially applied batch is recorded with
pub const PARTIAL_FAILURE_REASON: &str = "partial_failure";

/// The read-back check after a policy was applied
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Verification {
    /// the node reports the applied policy
    Confirmed,
    /// the node reports a different policy
    Mismatch {
        /// what the node reports
        actual: FeePolicy,
    },
    /// the read-back failed
    Unavailable(String),
    /// not attempted
    Skipped,
}

/// A successfully applied (or simulated) change
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApplyOutcome {
    /// the channel
    pub channel_id: ChannelId,
    /// the policy now in effect
    pub policy: FeePolicy,
    /// remote calls made, zero when simulated
    pub attempts: u32,
    /// shadow mode, the node was not called
    pub dry_run: bool,
    /// result of the read-back
    pub verification: Verification,
}

/// Failure to apply a change
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// The change was rejected before reaching the node
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The node call kept failing
    #[error("{channel_id}: remote call failed after {attempts} attempts: {source}")]
    Remote {
        /// the channel
        channel_id: ChannelId,
        /// calls made
        attempts: u32,
        /// the last error
        source: ClientError,
    },
}

impl ExecutionError {
    /// A stable, machine checkable reason
    pub fn reason(&self) -> &'static str {
        match self {
            ExecutionError::Validation(e) => e.reason(),
            ExecutionError::Remote { .. } => "execution_failed",
        }
    }
}

/// One element of a batch
#[derive(Clone, Debug)]
pub struct PolicyChange {
    /// the channel snapshot
    pub channel: Channel,
    /// the policy to apply
    pub policy: FeePolicy,
    /// why
    pub change_type: ChangeType,
}

/// The result of [`PolicyExecutor::batch_apply`]
#[derive(Debug)]
pub struct BatchOutcome {
    /// the committed transaction, absent in shadow mode
    pub transaction: Option<Transaction>,
    /// per channel result, in input order
    pub results: Vec<(ChannelId, Result<ApplyOutcome, ExecutionError>)>,
    /// channels left alone because no backup could be taken
    pub unbacked: Vec<ChannelId>,
    /// channels not attempted after an earlier failure
    pub not_attempted: Vec<ChannelId>,
    /// the rollback of a partial batch, when configured
    pub rollback: Option<RollbackReport>,
}

impl BatchOutcome {
    /// The final status of the batch transaction
    pub fn status(&self) -> Option<TransactionStatus> {
        self.transaction.as_ref().map(|tx| tx.status)
    }
}

/// Applies policy changes against the remote node
pub struct PolicyExecutor {
    config: ExecutorConfig,
    validator: Arc<PolicyValidator>,
    client: Arc<dyn NodeApi>,
}

impl PolicyExecutor {
    /// Create an executor
    pub fn new(
        config: ExecutorConfig,
        validator: Arc<PolicyValidator>,
        client: Arc<dyn NodeApi>,
    ) -> Self {
        PolicyExecutor { config, validator, client }
    }

    /// Whether changes are only simulated
    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// The validator gating this executor
    pub fn validator(&self) -> &Arc<PolicyValidator> {
        &self.validator
    }

    /// Apply one change.
    ///
    /// Changes to the same channel are serialized.  With `force` the validator
    /// is bypassed.
    #[instrument(skip(self, channel, policy), fields(channel_id = %channel.id))]
    pub async fn apply(
        &self,
        channel: &Channel,
        policy: &FeePolicy,
        change_type: ChangeType,
        force: bool,
    ) -> Result<ApplyOutcome, ExecutionError> {
        let lock = self.validator.channel_lock(&channel.id);
        let _guard = lock.lock().await;
        if force {
            warn!("validation bypassed for {} ({:?})", channel.id, change_type);
        } else {
            let change = ProposedChange::Policy { policy: policy.clone(), change_type };
            self.validator.validate(channel, &change)?;
        }
        self.execute(&channel.id, &channel.channel_ref, policy).await
    }

    /// Put back a backed up policy, bypassing validation
    #[instrument(skip(self, policy))]
    pub async fn restore(
        &self,
        channel_id: &ChannelId,
        channel_ref: &str,
        policy: &FeePolicy,
    ) -> Result<ApplyOutcome, ExecutionError> {
        let lock = self.validator.channel_lock(channel_id);
        let _guard = lock.lock().await;
        warn!("validation bypassed for {} (restore)", channel_id);
        self.execute(channel_id, channel_ref, policy).await
    }

    // caller holds the channel lock
    async fn execute(
        &self,
        channel_id: &ChannelId,
        channel_ref: &str,
        policy: &FeePolicy,
    ) -> Result<ApplyOutcome, ExecutionError> {
        if self.config.dry_run {
            info!(
                "dry run: would set {} to base {} msat, rate {} ppm",
                channel_id, policy.base_fee_msat, policy.fee_rate_ppm
            );
            return Ok(ApplyOutcome {
                channel_id: channel_id.clone(),
                policy: policy.clone(),
                attempts: 0,
                dry_run: true,
                verification: Verification::Skipped,
            });
        }

        let attempts = self.push(channel_id, channel_ref, policy).await?;
        let verification = self.verify(channel_id, channel_ref, policy).await;
        if let Err(e) = self.validator.record_change(channel_id) {
            warn!("could not persist change history of {}: {}", channel_id, e);
        }
        info!("applied policy to {} after {} attempt(s)", channel_id, attempts);
        Ok(ApplyOutcome {
            channel_id: channel_id.clone(),
            policy: policy.clone(),
            attempts,
            dry_run: false,
            verification,
        })
    }

    fn backoff(&self) -> ExponentialBackoff {
        let base = self.config.base_delay();
        // attempt n waits base * 2^(n-1), the attempt counter bounds the total
        ExponentialBackoffBuilder::default()
            .with_initial_interval(base)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(base * 2u32.pow(self.config.max_attempts.min(16)))
            .with_max_elapsed_time(None)
            .build()
    }

    async fn push(
        &self,
        channel_id: &ChannelId,
        channel_ref: &str,
        policy: &FeePolicy,
    ) -> Result<u32, ExecutionError> {
        let max_attempts = self.config.max_attempts;
        let timeout = self.config.call_timeout();
        let client = &self.client;
        let mut attempts = 0u32;
        let result = backoff::future::retry(self.backoff(), || {
            attempts += 1;
            let attempt = attempts;
            async move {
                let call = client.update_channel_policy(channel_ref, policy);
                let err = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => e,
                    Err(_) => ClientError::Timeout(timeout.as_secs()),
                };
                if !err.is_transient() || attempt >= max_attempts {
                    return Err(BackoffError::permanent(err));
                }
                warn!("attempt {}/{} on {} failed, retrying: {}", attempt, max_attempts, channel_id, err);
                Err(BackoffError::transient(err))
            }
        })
        .await;

        match result {
            Ok(()) => Ok(attempts),
            Err(source) => {
                error!("{}: giving up after {} attempt(s): {}", channel_id, attempts, source);
                Err(ExecutionError::Remote { channel_id: channel_id.clone(), attempts, source })
            }
        }
    }

    async fn verify(&self, channel_id: &ChannelId, channel_ref: &str, policy: &FeePolicy) -> Verification {
        if !self.config.verify {
            return Verification::Skipped;
        }
        let read = tokio::time::timeout(self.config.call_timeout(), self.client.get_channel(channel_ref));
        match read.await {
            Ok(Ok(channel)) if same_fees(&channel.policy, policy) => Verification::Confirmed,
            Ok(Ok(channel)) => {
                warn!("{}: node reports {:?} after applying {:?}", channel_id, channel.policy, policy);
                Verification::Mismatch { actual: channel.policy }
            }
            Ok(Err(e)) => {
                warn!("{}: verification unavailable: {}", channel_id, e);
                Verification::Unavailable(e.to_string())
            }
            Err(_) => {
                warn!("{}: verification timed out", channel_id);
                Verification::Unavailable("timed out".to_string())
            }
        }
    }

    async fn apply_reported(
        &self,
        txm: &TransactionManager,
        tx_id: &str,
        change: &PolicyChange,
    ) -> Result<ApplyOutcome, ExecutionError> {
        let result = self.apply(&change.channel, &change.policy, change.change_type, false).await;
        let progress = match &result {
            Ok(outcome) => Progress::Applied(outcome.policy.clone()),
            Err(e) => Progress::Failed(e.to_string()),
        };
        if let Err(e) = txm.report_progress(tx_id, &change.channel.id, progress) {
            error!("tx {}: could not record outcome of {}: {}", tx_id, change.channel.id, e);
        }
        result
    }

    /// Apply several changes inside one transaction.
    ///
    /// A channel listed more than once is changed once, to its last proposal.
    /// Every channel is backed up before any change is made; channels that
    /// cannot be backed up are left alone.  Changes run concurrently, up to
    /// `max_concurrency` at a time, unless `stop_on_error` is set, in which
    /// case they run in order and the first failure ends the batch.
    #[instrument(skip(self, txm, changes))]
    pub async fn batch_apply(
        &self,
        txm: &TransactionManager,
        node_id: &str,
        changes: Vec<PolicyChange>,
        stop_on_error: bool,
    ) -> Result<BatchOutcome, TransactionError> {
        let changes = dedup_changes(changes);
        if self.config.dry_run {
            let mut results = Vec::new();
            for change in &changes {
                let r = self.apply(&change.channel, &change.policy, change.change_type, false).await;
                results.push((change.channel.id.clone(), r));
            }
            return Ok(BatchOutcome {
                transaction: None,
                results,
                unbacked: Vec::new(),
                not_attempted: Vec::new(),
                rollback: None,
            });
        }

        let channels: Vec<Channel> = changes.iter().map(|c| c.channel.clone()).collect();
        let tx = txm.begin(node_id, &channels, OperationType::FeeUpdate)?;
        let tx_id = tx.id.as_str();

        let (todo, unbacked): (Vec<_>, Vec<_>) = changes
            .into_iter()
            .enumerate()
            .partition(|(_, c)| tx.target_channels.contains(&c.channel.id));
        let unbacked: Vec<ChannelId> = unbacked.into_iter().map(|(_, c)| c.channel.id).collect();

        let mut results = Vec::new();
        let mut not_attempted = Vec::new();
        if stop_on_error {
            let mut failed = false;
            for (_, change) in todo {
                if failed {
                    not_attempted.push(change.channel.id);
                    continue;
                }
                let r = self.apply_reported(txm, tx_id, &change).await;
                failed = r.is_err();
                results.push((change.channel.id, r));
            }
        } else {
            let mut indexed: Vec<_> = stream::iter(todo)
                .map(|(i, change)| async move {
                    let r = self.apply_reported(txm, tx_id, &change).await;
                    (i, change.channel.id, r)
                })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;
            indexed.sort_by_key(|(i, _, _)| *i);
            results = indexed.into_iter().map(|(_, id, r)| (id, r)).collect();
        }

        let mut committed = txm.commit(tx_id)?;
        let mut rollback = None;
        if committed.status == TransactionStatus::Partial
            && txm.partial_policy() == PartialPolicy::Revert
        {
            warn!("tx {}: partial batch, reverting all channels", tx_id);
            let report = txm.rollback(tx_id, PARTIAL_FAILURE_REASON).await?;
            committed = txm.get(tx_id)?;
            rollback = Some(report);
        }

        Ok(BatchOutcome { transaction: Some(committed), results, unbacked, not_attempted, rollback })
    }
}

// one change per channel, a later proposal replaces an earlier one in place
fn dedup_changes(changes: Vec<PolicyChange>) -> Vec<PolicyChange> {
    let mut out: Vec<PolicyChange> = Vec::with_capacity(changes.len());
    for change in changes {
        match out.iter_mut().find(|c| c.channel.id == change.channel.id) {
            Some(existing) => {
                warn!("{} listed twice in a batch, keeping the later change", change.channel.id);
                *existing = change;
            }
            None => out.push(change),
        }
    }
    out
}

fn same_fees(actual: &FeePolicy, expected: &FeePolicy) -> bool {
    actual.base_fee_msat == expected.base_fee_msat
        && actual.fee_rate_ppm == expected.fee_rate_ppm
        && actual.time_lock_delta == expected.time_lock_delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;
    use crate::util::clock::ManualClock;
    use crate::backup::BackupManager;
    use crate::config::{BackupConfig, TransactionConfig};
    use crate::persist::memory::MemoryStore;
    use crate::util::test_utils::{make_channel, make_policy, MockNodeClient};
    use test_log::test;

    fn setup(config: ExecutorConfig) -> (PolicyExecutor, Arc<MockNodeClient>) {
        let clock = Arc::new(ManualClock::from_secs(1_700_000_000));
        let validator = Arc::new(PolicyValidator::new(ValidatorConfig::default(), clock));
        let client = Arc::new(MockNodeClient::new());
        (PolicyExecutor::new(config, validator, client.clone()), client)
    }

    fn fast() -> ExecutorConfig {
        ExecutorConfig { base_delay_ms: 1, ..Default::default() }
    }

    #[test(tokio::test)]
    async fn apply_and_verify() {
        let (executor, client) = setup(fast());
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        let outcome =
            executor.apply(&channel, &make_policy(1000, 700), ChangeType::FeeIncrease, false).await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.verification, Verification::Confirmed);
        assert!(!outcome.dry_run);
        assert_eq!(client.policy_of(&channel.channel_ref), Some(make_policy(1000, 700)));
        // recorded, so the next change is in cooldown
        let err = executor
            .apply(&channel, &make_policy(1000, 800), ChangeType::FeeIncrease, false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "cooldown");
    }

    #[test(tokio::test)]
    async fn force_bypasses_validation() {
        let (executor, client) = setup(fast());
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        let huge = make_policy(1000, 4000);
        let err = executor.apply(&channel, &huge, ChangeType::Manual, false).await.unwrap_err();
        assert_eq!(err.reason(), "excessive_change");
        assert!(client.calls().is_empty());
        executor.apply(&channel, &huge, ChangeType::Manual, true).await.unwrap();
        assert_eq!(client.calls().len(), 1);
    }

    #[test(tokio::test)]
    async fn retries_transient_failures() {
        let (executor, client) = setup(fast());
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        client.fail_next(&channel.channel_ref, 2, ClientError::Transport("reset".into()));
        let outcome =
            executor.apply(&channel, &make_policy(1000, 600), ChangeType::Manual, false).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(client.calls().len(), 3);
    }

    #[test(tokio::test)]
    async fn gives_up_after_max_attempts() {
        let (executor, client) = setup(fast());
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        client.fail_next(&channel.channel_ref, 5, ClientError::Timeout(30));
        let err = executor
            .apply(&channel, &make_policy(1000, 600), ChangeType::Manual, false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "execution_failed");
        assert!(matches!(err, ExecutionError::Remote { attempts: 3, .. }));
        assert_eq!(client.calls().len(), 3);
        // not recorded
        assert_eq!(executor.validator().changes_in_window(&channel.id), 0);
    }

    #[test(tokio::test)]
    async fn permanent_failure_is_not_retried() {
        let (executor, client) = setup(fast());
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        client.fail_next(&channel.channel_ref, 1, ClientError::Rejected("bad policy".into()));
        let err = executor
            .apply(&channel, &make_policy(1000, 600), ChangeType::Manual, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Remote { attempts: 1, .. }));
    }

    #[test(tokio::test)]
    async fn failed_verification_is_not_fatal() {
        let (executor, client) = setup(fast());
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        client.set_reads_unavailable(true);
        let outcome =
            executor.apply(&channel, &make_policy(1000, 600), ChangeType::Manual, false).await.unwrap();
        assert!(matches!(outcome.verification, Verification::Unavailable(_)));
    }

    #[test(tokio::test)]
    async fn dry_run_does_not_call_node() {
        let (executor, client) = setup(ExecutorConfig { dry_run: true, ..fast() });
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        let outcome =
            executor.apply(&channel, &make_policy(1000, 600), ChangeType::Manual, false).await.unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.attempts, 0);
        assert!(client.calls().is_empty());
        assert_eq!(executor.validator().changes_in_window(&channel.id), 0);
        // invalid changes are still rejected
        let err = executor
            .apply(&channel, &make_policy(1000, 4000), ChangeType::Manual, false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "excessive_change");
    }

    #[test(tokio::test)]
    async fn same_channel_is_serialized() {
        let (executor, client) = setup(fast());
        let executor = Arc::new(executor);
        let channel = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(channel.clone());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let executor = executor.clone();
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                executor.apply(&channel, &make_policy(1000, 600), ChangeType::Manual, false).await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        // the first change starts the cooldown for the rest
        assert_eq!(ok, 1);
        assert_eq!(client.calls().len(), 1);
    }

    #[test(tokio::test)]
    async fn duplicate_channels_in_a_batch_apply_once() {
        let clock = Arc::new(ManualClock::from_secs(1_700_000_000));
        let validator = Arc::new(PolicyValidator::new(ValidatorConfig::default(), clock.clone()));
        let client = Arc::new(MockNodeClient::new());
        let executor = Arc::new(PolicyExecutor::new(fast(), validator, client.clone()));
        let store = Arc::new(MemoryStore::new());
        let backups = Arc::new(BackupManager::new(BackupConfig::default(), store.clone(), clock.clone()));
        let txm =
            TransactionManager::new(TransactionConfig::default(), store, backups.clone(), executor.clone(), clock);

        let a = make_channel("a", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        let b = make_channel("b", 1_000_000, 500_000, 500_000, make_policy(1000, 500));
        client.add_channel(a.clone());
        client.add_channel(b.clone());
        let change = |channel: &Channel, fee_rate_ppm| PolicyChange {
            channel: channel.clone(),
            policy: make_policy(1000, fee_rate_ppm),
            change_type: ChangeType::FeeIncrease,
        };

        let outcome = executor
            .batch_apply(&txm, "node", vec![change(&a, 600), change(&b, 600), change(&a, 700)], false)
            .await
            .unwrap();
        let ids: Vec<_> = outcome.results.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);
        let tx = outcome.transaction.unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
        assert_eq!(tx.modified_channels.len(), 2);
        assert_eq!(client.calls_for(&a.channel_ref), 1);
        assert_eq!(client.policy_of(&a.channel_ref), Some(make_policy(1000, 700)));
        let backup = backups.get(&tx.backups[0].backup_id).unwrap();
        assert_eq!(backup.channel_id, a.id);
        assert_eq!(backup.policy_after, Some(make_policy(1000, 700)));
    }
}
