use core::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::*;
use triggered::{Listener, Trigger};

use crate::backup::{BackupError, BackupManager};
use crate::channel::{ChannelId, FeePolicy};
use crate::config::RollbackConfig;
use crate::node::{ClientError, Notifier};
use crate::prelude::*;
use crate::transaction::{
    RestoreFailure, RollbackReport, TransactionError, TransactionManager, TransactionStatus,
};
use crate::Arc;

/// Health of the node after a change, compared to before it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostChangeMetrics {
    /// share of failed forwards, in `[0, 1]`
    pub error_rate: f64,
    /// forward latency after the change divided by latency before it
    pub latency_ratio: f64,
    /// observations behind the figures
    pub sample_count: u32,
}

/// Where post-change metrics come from
#[async_trait]
pub trait MetricsSource: SendSync {
    /// Collect the current metrics for a transaction
    async fn collect(&self, transaction_id: &str) -> Result<PostChangeMetrics, ClientError>;
}

/// Errors from the rollback orchestrator
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RollbackError {
    /// The operator did not confirm a manual rollback
    #[error("rollback of transaction {0} not confirmed")]
    NotConfirmed(String),
    /// The transaction could not be read or rolled back
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// The backup store failed
    #[error(transparent)]
    Backup(#[from] BackupError),
}

impl RollbackError {
    /// A stable, machine checkable reason
    pub fn reason(&self) -> &'static str {
        match self {
            RollbackError::NotConfirmed(_) => "not_confirmed",
            RollbackError::Transaction(e) => e.reason(),
            RollbackError::Backup(e) => e.reason(),
        }
    }
}

/// One channel of a rollback preview
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelPreview {
    #[allow(missing_docs)]
    pub channel_id: ChannelId,
    #[allow(missing_docs)]
    pub backup_id: String,
    /// the policy that would be restored, if the backup is intact
    pub policy_before: Option<FeePolicy>,
    /// the policy applied by the transaction
    pub policy_after: Option<FeePolicy>,
}

/// What a manual rollback would do
#[derive(Clone, Debug, PartialEq)]
pub struct RollbackPreview {
    #[allow(missing_docs)]
    pub transaction_id: String,
    #[allow(missing_docs)]
    pub node_id: String,
    /// current status
    pub status: TransactionStatus,
    /// channels affected
    pub channels: Vec<ChannelPreview>,
}

/// How a monitoring task ended
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorOutcome {
    /// the window ended without a rollback
    Completed {
        /// metrics collections made
        ticks: u32,
    },
    /// metrics crossed a threshold and the transaction was rolled back
    RolledBack(RollbackReport),
    /// stopped by [`MonitorHandle::cancel`]
    Cancelled,
    /// the rollback could not be attempted
    Failed(String),
}

/// A running monitoring task
pub struct MonitorHandle {
    trigger: Trigger,
    task: JoinHandle<MonitorOutcome>,
}

impl MonitorHandle {
    /// Stop monitoring.  Any metrics collection in flight is dropped.
    pub fn cancel(&self) {
        self.trigger.trigger();
    }

    /// Whether the task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end
    pub async fn join(self) -> MonitorOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => MonitorOutcome::Failed(e.to_string()),
        }
    }
}

/// Coordinates automatic, manual and partial rollbacks
pub struct RollbackOrchestrator {
    config: RollbackConfig,
    transactions: Arc<TransactionManager>,
    backups: Arc<BackupManager>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl RollbackOrchestrator {
    /// Create an orchestrator.  Without a notifier, alerts are only logged.
    pub fn new(
        config: RollbackConfig,
        transactions: Arc<TransactionManager>,
        backups: Arc<BackupManager>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        RollbackOrchestrator { config, transactions, backups, notifier }
    }

    async fn notify(&self, message: &str) {
        match &self.notifier {
            Some(notifier) =>
                if let Err(e) = notifier.send_alert(message).await {
                    warn!("alert not delivered ({}): {}", e, message);
                },
            None => warn!("alert: {}", message),
        }
    }

    /// Whether the metrics call for a rollback
    pub fn should_roll_back(&self, metrics: &PostChangeMetrics) -> bool {
        metrics.sample_count >= self.config.min_samples
            && (metrics.error_rate >= self.config.error_rate_threshold
                || metrics.latency_ratio >= self.config.latency_ratio_threshold)
    }

    /// Roll back a transaction if its metrics crossed a threshold
    pub async fn auto_rollback_on_failure(
        &self,
        tx_id: &str,
        metrics: &PostChangeMetrics,
    ) -> Result<Option<RollbackReport>, RollbackError> {
        if metrics.sample_count < self.config.min_samples {
            debug!("tx {}: {} samples, not enough to judge", tx_id, metrics.sample_count);
            return Ok(None);
        }
        if !self.should_roll_back(metrics) {
            return Ok(None);
        }
        let reason = format!(
            "auto: error_rate {:.2}, latency_ratio {:.2} over {} samples",
            metrics.error_rate, metrics.latency_ratio, metrics.sample_count
        );
        warn!("tx {}: {}", tx_id, reason);
        let report = self.transactions.rollback(tx_id, &reason).await?;
        self.notify(&format!("automatic rollback, {}; {}", reason, report)).await;
        Ok(Some(report))
    }

    /// What a rollback of the transaction would touch
    pub fn preview(&self, tx_id: &str) -> Result<RollbackPreview, RollbackError> {
        let tx = self.transactions.get(tx_id)?;
        let mut channels = Vec::new();
        for backup_ref in &tx.backups {
            let backup = self.backups.get(&backup_ref.backup_id)?;
            channels.push(ChannelPreview {
                channel_id: backup_ref.channel_id.clone(),
                backup_id: backup.id.clone(),
                policy_before: self.backups.restore_policy(&backup).ok(),
                policy_after: backup.policy_after.clone(),
            });
        }
        Ok(RollbackPreview { transaction_id: tx.id, node_id: tx.node_id, status: tx.status, channels })
    }

    /// Roll back on operator request.
    ///
    /// With `require_confirmation`, `confirm` is shown the preview and the
    /// rollback only proceeds if it returns true.
    pub async fn manual_rollback<F>(
        &self,
        tx_id: &str,
        reason: &str,
        require_confirmation: bool,
        confirm: F,
    ) -> Result<RollbackReport, RollbackError>
    where
        F: FnOnce(&RollbackPreview) -> bool,
    {
        if require_confirmation {
            let preview = self.preview(tx_id)?;
            if !confirm(&preview) {
                info!("tx {}: manual rollback declined", tx_id);
                return Err(RollbackError::NotConfirmed(tx_id.to_string()));
            }
        }
        let report = self.transactions.rollback(tx_id, reason).await?;
        self.notify(&format!("manual rollback ({}): {}", reason, report)).await;
        Ok(report)
    }

    /// Restore some channels of a transaction from their latest backup.
    ///
    /// The transaction status is unchanged; restored channels are recorded
    /// as reverted, except in shadow mode where nothing is recorded.
    #[instrument(skip(self, channels))]
    pub async fn partial_rollback(
        &self,
        tx_id: &str,
        channels: &[ChannelId],
        reason: &str,
    ) -> Result<RollbackReport, RollbackError> {
        let tx = self.transactions.get(tx_id)?;
        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for channel_id in channels {
            let failure = |backup_id: &str, reason: &str, message: String| RestoreFailure {
                channel_id: channel_id.clone(),
                backup_id: backup_id.to_string(),
                reason: reason.to_string(),
                message,
            };
            if !tx.target_channels.contains(channel_id) {
                failed.push(failure("", "unknown_channel", format!("{} is not part of {}", channel_id, tx_id)));
                continue;
            }
            let backup = match self.backups.get_latest(channel_id, Some(&tx.node_id))? {
                Some(backup) => backup,
                None => {
                    failed.push(failure("", "not_found", format!("no backup of {}", channel_id)));
                    continue;
                }
            };
            match self.transactions.restore_one(&backup.id).await {
                Ok(()) => restored.push(channel_id.clone()),
                Err((reason, message)) => {
                    error!("tx {}: partial restore of {} failed: {}", tx_id, channel_id, message);
                    failed.push(failure(&backup.id, reason, message));
                }
            }
        }

        let dry_run = self.transactions.is_dry_run();
        if !restored.is_empty() && !dry_run {
            self.transactions.record_reverted(tx_id, &restored)?;
        }
        let report =
            RollbackReport { transaction_id: tx_id.to_string(), status: tx.status, restored, failed, dry_run };
        info!("partial rollback ({}): {}", reason, report);
        Ok(report)
    }

    /// Watch a transaction in the background, rolling it back if its metrics
    /// cross a threshold.
    ///
    /// Metrics are collected every `interval` until `duration` has passed or a
    /// rollback happens.
    pub fn monitor_transaction(
        self: &Arc<Self>,
        tx_id: &str,
        duration: Duration,
        interval: Duration,
        source: Arc<dyn MetricsSource>,
    ) -> MonitorHandle {
        let (trigger, listener) = triggered::trigger();
        let this = Arc::clone(self);
        let tx_id = tx_id.to_string();
        info!("monitoring tx {} for {:?} every {:?}", tx_id, duration, interval);
        let task = tokio::spawn(async move {
            this.monitor_loop(&tx_id, duration, interval, source, listener).await
        });
        MonitorHandle { trigger, task }
    }

    /// [`Self::monitor_transaction`] with the configured window and interval
    pub fn monitor_with_defaults(
        self: &Arc<Self>,
        tx_id: &str,
        source: Arc<dyn MetricsSource>,
    ) -> MonitorHandle {
        let duration = Duration::from_secs(self.config.monitor_duration_secs);
        let interval = Duration::from_secs(self.config.monitor_interval_secs);
        self.monitor_transaction(tx_id, duration, interval, source)
    }

    async fn monitor_loop(
        &self,
        tx_id: &str,
        duration: Duration,
        interval: Duration,
        source: Arc<dyn MetricsSource>,
        shutdown: Listener,
    ) -> MonitorOutcome {
        let start = Instant::now();
        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = shutdown.clone() => {
                    info!("monitor of tx {} cancelled", tx_id);
                    return MonitorOutcome::Cancelled;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if start.elapsed() > duration {
                info!("monitor of tx {} finished after {} collections", tx_id, ticks);
                return MonitorOutcome::Completed { ticks };
            }
            ticks += 1;
            let collected = tokio::select! {
                _ = shutdown.clone() => {
                    info!("monitor of tx {} cancelled during collection", tx_id);
                    return MonitorOutcome::Cancelled;
                }
                m = source.collect(tx_id) => m,
            };
            let metrics = match collected {
                Ok(metrics) => metrics,
                Err(e) => {
                    warn!("tx {}: metrics unavailable: {}", tx_id, e);
                    continue;
                }
            };
            match self.auto_rollback_on_failure(tx_id, &metrics).await {
                Ok(Some(report)) => return MonitorOutcome::RolledBack(report),
                Ok(None) => {}
                Err(e) => {
                    error!("tx {}: automatic rollback failed: {}", tx_id, e);
                    return MonitorOutcome::Failed(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, ExecutorConfig, TransactionConfig, ValidatorConfig};
    use crate::executor::PolicyExecutor;
    use crate::persist::memory::MemoryStore;
    use crate::policy::validator::PolicyValidator;
    use crate::transaction::{OperationType, Progress};
    use crate::util::clock::ManualClock;
    use crate::util::test_utils::{
        make_channel, make_policy, MockNodeClient, RecordingNotifier, ScriptedMetrics,
    };
    use test_log::test;

    struct Fixture {
        orchestrator: Arc<RollbackOrchestrator>,
        txm: Arc<TransactionManager>,
        client: Arc<MockNodeClient>,
        notifier: Arc<RecordingNotifier>,
        tx_id: String,
        channels: Vec<crate::channel::Channel>,
    }

    fn fixture() -> Fixture {
        fixture_with(false)
    }

    fn fixture_with(dry_run: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::from_secs(1_700_000_000));
        let client = Arc::new(MockNodeClient::new());
        let validator = Arc::new(PolicyValidator::new(ValidatorConfig::default(), clock.clone()));
        let executor = Arc::new(PolicyExecutor::new(
            ExecutorConfig { base_delay_ms: 1, dry_run, ..Default::default() },
            validator,
            client.clone(),
        ));
        let backups = Arc::new(BackupManager::new(BackupConfig::default(), store.clone(), clock.clone()));
        let txm = Arc::new(TransactionManager::new(
            TransactionConfig::default(),
            store,
            backups.clone(),
            executor,
            clock,
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = Arc::new(RollbackOrchestrator::new(
            RollbackConfig::default(),
            txm.clone(),
            backups,
            Some(notifier.clone()),
        ));

        let channels: Vec<_> = ["a", "b"]
            .iter()
            .map(|id| make_channel(id, 1_000_000, 500_000, 500_000, make_policy(1000, 500)))
            .collect();
        for c in &channels {
            client.add_channel(c.clone());
        }
        let tx = txm.begin("node", &channels, OperationType::FeeUpdate).unwrap();
        for c in &channels {
            client.set_policy(&c.channel_ref, make_policy(1000, 700));
            txm.report_progress(&tx.id, &c.id, Progress::Applied(make_policy(1000, 700))).unwrap();
        }
        txm.commit(&tx.id).unwrap();
        Fixture { orchestrator, txm, client, notifier, tx_id: tx.id, channels }
    }

    fn metrics(error_rate: f64, latency_ratio: f64, sample_count: u32) -> PostChangeMetrics {
        PostChangeMetrics { error_rate, latency_ratio, sample_count }
    }

    #[test(tokio::test)]
    async fn auto_rollback_thresholds() {
        let f = fixture();
        let o = &f.orchestrator;
        assert!(!o.should_roll_back(&metrics(0.9, 5.0, 2)));
        assert!(!o.should_roll_back(&metrics(0.49, 1.99, 10)));
        assert!(o.should_roll_back(&metrics(0.5, 1.0, 3)));
        assert!(o.should_roll_back(&metrics(0.0, 2.0, 3)));

        assert_eq!(o.auto_rollback_on_failure(&f.tx_id, &metrics(0.9, 1.0, 2)).await.unwrap(), None);
        assert!(f.notifier.messages().is_empty());

        let report = o.auto_rollback_on_failure(&f.tx_id, &metrics(0.6, 1.0, 5)).await.unwrap().unwrap();
        assert_eq!(report.status, TransactionStatus::RolledBack);
        assert_eq!(f.client.policy_of(&f.channels[0].channel_ref), Some(make_policy(1000, 500)));
        let messages = f.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains(&f.tx_id));
    }

    #[test(tokio::test)]
    async fn shadow_mode_rollbacks_are_simulated() {
        let f = fixture_with(true);
        let report = f.orchestrator.manual_rollback(&f.tx_id, "operator", false, |_| true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.restored.len(), 2);
        assert_eq!(report.status, TransactionStatus::Success);

        let partial = f.orchestrator.partial_rollback(&f.tx_id, &[f.channels[0].id.clone()], "one").await.unwrap();
        assert!(partial.dry_run);
        assert_eq!(partial.restored, vec![f.channels[0].id.clone()]);

        assert!(f.client.calls().is_empty());
        assert_eq!(f.client.policy_of(&f.channels[0].channel_ref), Some(make_policy(1000, 700)));
        let tx = f.txm.get(&f.tx_id).unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
        assert!(tx.reverted_channels.is_empty());
    }

    #[test(tokio::test)]
    async fn manual_rollback_needs_confirmation() {
        let f = fixture();
        let err = f
            .orchestrator
            .manual_rollback(&f.tx_id, "operator", true, |preview| {
                assert_eq!(preview.channels.len(), 2);
                assert_eq!(preview.status, TransactionStatus::Success);
                assert_eq!(preview.channels[0].policy_before, Some(make_policy(1000, 500)));
                assert_eq!(preview.channels[0].policy_after, Some(make_policy(1000, 700)));
                false
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "not_confirmed");
        assert_eq!(f.txm.get(&f.tx_id).unwrap().status, TransactionStatus::Success);

        let report = f.orchestrator.manual_rollback(&f.tx_id, "operator", true, |_| true).await.unwrap();
        assert_eq!(report.status, TransactionStatus::RolledBack);
    }

    #[test(tokio::test)]
    async fn manual_rollback_without_confirmation() {
        let f = fixture();
        let report = f
            .orchestrator
            .manual_rollback(&f.tx_id, "operator", false, |_| panic!("not asked"))
            .await
            .unwrap();
        assert!(report.is_complete());
    }

    #[test(tokio::test)]
    async fn partial_rollback_keeps_status() {
        let f = fixture();
        let a = f.channels[0].id.clone();
        let report = f
            .orchestrator
            .partial_rollback(&f.tx_id, &[a.clone(), "zzz".into()], "peer complaint")
            .await
            .unwrap();
        assert_eq!(report.restored, vec![a.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].reason, "unknown_channel");
        assert_eq!(f.client.policy_of(&f.channels[0].channel_ref), Some(make_policy(1000, 500)));
        assert_eq!(f.client.policy_of(&f.channels[1].channel_ref), Some(make_policy(1000, 700)));
        let tx = f.txm.get(&f.tx_id).unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
        assert_eq!(tx.reverted_channels, vec![a]);
    }

    #[test(tokio::test(start_paused = true))]
    async fn monitor_rolls_back_on_bad_metrics() {
        let f = fixture();
        let source = Arc::new(ScriptedMetrics::new(vec![
            metrics(0.0, 1.0, 5),
            metrics(0.1, 1.1, 5),
            metrics(0.7, 1.0, 5),
        ]));
        let handle = f.orchestrator.monitor_transaction(
            &f.tx_id,
            Duration::from_secs(600),
            Duration::from_secs(60),
            source.clone(),
        );
        match handle.join().await {
            MonitorOutcome::RolledBack(report) => assert!(report.is_complete()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(source.calls(), 3);
        assert_eq!(f.txm.get(&f.tx_id).unwrap().status, TransactionStatus::RolledBack);
    }

    #[test(tokio::test(start_paused = true))]
    async fn monitor_completes_when_healthy() {
        let f = fixture();
        let source = Arc::new(ScriptedMetrics::new(vec![metrics(0.0, 1.0, 5)]));
        let handle = f.orchestrator.monitor_transaction(
            &f.tx_id,
            Duration::from_secs(330),
            Duration::from_secs(60),
            source.clone(),
        );
        assert_eq!(handle.join().await, MonitorOutcome::Completed { ticks: 5 });
        assert_eq!(source.calls(), 5);
        assert_eq!(f.txm.get(&f.tx_id).unwrap().status, TransactionStatus::Success);
    }

    #[test(tokio::test(start_paused = true))]
    async fn monitor_cancel_stops_collection() {
        let f = fixture();
        let source = Arc::new(ScriptedMetrics::stalled());
        let handle = f.orchestrator.monitor_transaction(
            &f.tx_id,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            source.clone(),
        );
        // let the first collection start and stall
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(source.calls(), 1);
        handle.cancel();
        assert_eq!(handle.join().await, MonitorOutcome::Cancelled);
        assert_eq!(f.txm.get(&f.tx_id).unwrap().status, TransactionStatus::Success);
    }
}
