use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::backup::{BackupError, BackupManager};
use crate::channel::{Channel, ChannelId, FeePolicy};
use crate::config::{PartialPolicy, TransactionConfig};
use crate::executor::PolicyExecutor;
use crate::persist::{self, from_document, to_document, Filter, Sort, Store, UpdateOutcome};
use crate::util::clock::Clock;
use crate::Arc;

/// The collection transactions are stored in
pub const TRANSACTION_COLLECTION: &str = "transactions";

// concurrent writers to the same transaction retry this many times
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Lifecycle state of a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// open, changes are being applied
    Pending,
    /// every target channel was changed
    Success,
    /// some target channels were changed
    Partial,
    /// no channel was changed, or a rollback did not complete
    Failed,
    /// every backed up channel was restored
    RolledBack,
    /// a rollback is restoring channels
    RollingBack,
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Partial => "PARTIAL",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::RolledBack => "ROLLED_BACK",
            TransactionStatus::RollingBack => "ROLLING_BACK",
        };
        f.write_str(s)
    }
}

/// What a transaction does
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// fee policy changes proposed by the decision cycle
    FeeUpdate,
    /// operator requested policy changes
    Manual,
}

/// A backup taken for a transaction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupRef {
    #[allow(missing_docs)]
    pub channel_id: ChannelId,
    #[allow(missing_docs)]
    pub backup_id: String,
}

/// A channel that was not changed, and why
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelFailure {
    #[allow(missing_docs)]
    pub channel_id: ChannelId,
    #[allow(missing_docs)]
    pub error: String,
}

/// A multi-channel change with all-or-report semantics.
///
/// `target_channels` only holds channels with a backup, and
/// `modified_channels` is always a subset of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// transaction id
    #[serde(rename = "_id")]
    pub id: String,
    /// the managed node
    pub node_id: String,
    /// what the transaction does
    pub operation: OperationType,
    /// lifecycle state
    pub status: TransactionStatus,
    /// channels that may be changed
    pub target_channels: Vec<ChannelId>,
    /// channels that were changed
    pub modified_channels: Vec<ChannelId>,
    /// the backup of each target channel
    pub backups: Vec<BackupRef>,
    /// channels dropped at the start because no backup could be taken
    pub excluded_channels: Vec<ChannelFailure>,
    /// target channels whose change failed
    pub failed_channels: Vec<ChannelFailure>,
    /// channels restored by a rollback
    pub reverted_channels: Vec<ChannelId>,
    /// summary of what went wrong
    pub error: Option<String>,
    /// why the transaction was rolled back
    pub rollback_reason: Option<String>,
    /// seconds since the epoch
    pub created_at: u64,
    /// seconds since the epoch
    pub updated_at: u64,
    /// seconds since the epoch
    pub committed_at: Option<u64>,
    /// seconds since the epoch
    pub rolled_back_at: Option<u64>,
    /// bumped on every write, used for compare-and-set
    pub revision: u64,
}

impl Transaction {
    /// The backup ids, in target order
    pub fn backup_ids(&self) -> Vec<String> {
        self.backups.iter().map(|b| b.backup_id.clone()).collect()
    }

    fn check_status(&self, operation: &'static str, allowed: &[TransactionStatus]) -> Result<(), TransactionError> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(TransactionError::InvalidState { id: self.id.clone(), status: self.status, operation })
    }
}

/// The outcome of one channel in a batch
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    /// the change was applied
    Applied(FeePolicy),
    /// the change failed
    Failed(String),
}

/// Errors from the transaction manager
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransactionError {
    /// Unknown transaction
    #[error("transaction {0} not found")]
    NotFound(String),
    /// The operation is not allowed in the current state
    #[error("transaction {id}: cannot {operation} in state {status}")]
    InvalidState {
        /// the transaction
        id: String,
        /// its state
        status: TransactionStatus,
        /// the refused operation
        operation: &'static str,
    },
    /// The channel is not a target of the transaction
    #[error("transaction {id}: channel {channel_id} is not a target")]
    UnknownChannel {
        /// the transaction
        id: String,
        /// the channel
        channel_id: ChannelId,
    },
    /// Concurrent writers kept winning the compare-and-set
    #[error("transaction {0}: too many concurrent updates")]
    Contended(String),
    /// The backup store failed
    #[error(transparent)]
    Backup(#[from] BackupError),
    /// The store failed
    #[error(transparent)]
    Persist(#[from] persist::Error),
}

impl TransactionError {
    /// A stable, machine checkable reason
    pub fn reason(&self) -> &'static str {
        match self {
            TransactionError::NotFound(_) => "not_found",
            TransactionError::InvalidState { .. } => "invalid_state",
            TransactionError::UnknownChannel { .. } => "unknown_channel",
            TransactionError::Contended(_) => "contended",
            TransactionError::Backup(e) => e.reason(),
            TransactionError::Persist(e) => e.reason(),
        }
    }
}

/// Restore result of one channel
#[derive(Clone, Debug, PartialEq)]
pub struct RestoreFailure {
    /// the channel
    pub channel_id: ChannelId,
    /// the backup that was being restored
    pub backup_id: String,
    /// machine checkable reason
    pub reason: String,
    /// details
    pub message: String,
}

/// The result of a rollback
#[derive(Clone, Debug, PartialEq)]
pub struct RollbackReport {
    /// the transaction
    pub transaction_id: String,
    /// final status
    pub status: TransactionStatus,
    /// channels put back to their backed up policy
    pub restored: Vec<ChannelId>,
    /// channels that could not be restored
    pub failed: Vec<RestoreFailure>,
    /// shadow mode, nothing was restored and the transaction is unchanged
    pub dry_run: bool,
}

impl RollbackReport {
    /// Whether every channel was restored
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Display for RollbackReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction {}: {} ({} restored",
            self.transaction_id,
            self.status,
            self.restored.len()
        )?;
        if self.dry_run {
            f.write_str(" in dry run")?;
        }
        for failure in &self.failed {
            write!(f, ", {} {}", failure.channel_id, failure.reason)?;
        }
        f.write_str(")")
    }
}

/// Orchestrates multi-channel changes
pub struct TransactionManager {
    config: TransactionConfig,
    store: Arc<dyn Store>,
    backups: Arc<BackupManager>,
    executor: Arc<PolicyExecutor>,
    clock: Arc<dyn Clock>,
}

impl TransactionManager {
    /// Create a transaction manager
    pub fn new(
        config: TransactionConfig,
        store: Arc<dyn Store>,
        backups: Arc<BackupManager>,
        executor: Arc<PolicyExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        TransactionManager { config, store, backups, executor, clock }
    }

    /// Whether restores are only simulated
    pub fn is_dry_run(&self) -> bool {
        self.executor.is_dry_run()
    }

    /// How PARTIAL batches are handled
    pub fn partial_policy(&self) -> PartialPolicy {
        self.config.partial_policy
    }

    /// Open a transaction, backing up every channel first.
    ///
    /// A channel whose backup fails is excluded from the targets and will not
    /// be changed.
    #[instrument(skip(self, channels), fields(channels = channels.len()))]
    pub fn begin(
        &self,
        node_id: &str,
        channels: &[Channel],
        operation: OperationType,
    ) -> Result<Transaction, TransactionError> {
        let now = self.clock.now_secs();
        let id = uuid::Uuid::new_v4().to_string();
        let mut tx = Transaction {
            id: id.clone(),
            node_id: node_id.to_string(),
            operation,
            status: TransactionStatus::Pending,
            target_channels: Vec::new(),
            modified_channels: Vec::new(),
            backups: Vec::new(),
            excluded_channels: Vec::new(),
            failed_channels: Vec::new(),
            reverted_channels: Vec::new(),
            error: None,
            rollback_reason: None,
            created_at: now,
            updated_at: now,
            committed_at: None,
            rolled_back_at: None,
            revision: 0,
        };

        for channel in channels {
            if tx.target_channels.contains(&channel.id) {
                warn!("tx {}: duplicate channel {} ignored", id, channel.id);
                continue;
            }
            match self.backups.create(channel, Some(&id), Some(node_id)) {
                Ok(backup) => {
                    tx.target_channels.push(channel.id.clone());
                    tx.backups.push(BackupRef { channel_id: channel.id.clone(), backup_id: backup.id });
                }
                Err(e) => {
                    error!("tx {}: backup of {} failed, excluding it: {}", id, channel.id, e);
                    tx.excluded_channels
                        .push(ChannelFailure { channel_id: channel.id.clone(), error: e.to_string() });
                }
            }
        }

        self.store.insert_one(TRANSACTION_COLLECTION, to_document(&tx)?)?;
        info!(
            "tx {} begun on {} with {} target(s), {} excluded",
            id,
            node_id,
            tx.target_channels.len(),
            tx.excluded_channels.len()
        );
        Ok(tx)
    }

    /// Get a transaction
    pub fn get(&self, tx_id: &str) -> Result<Transaction, TransactionError> {
        match self.store.find_one(TRANSACTION_COLLECTION, &Filter::by_id(tx_id))? {
            Some(doc) => Ok(from_document(doc)?),
            None => Err(TransactionError::NotFound(tx_id.to_string())),
        }
    }

    /// Recent transactions, newest first
    pub fn list(&self, node_id: Option<&str>, limit: usize) -> Result<Vec<Transaction>, TransactionError> {
        let mut filter = Filter::all();
        if let Some(node_id) = node_id {
            filter = filter.eq("node_id", node_id);
        }
        let docs =
            self.store.find(TRANSACTION_COLLECTION, &filter, Some(&Sort::desc("created_at")), Some(limit))?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(from_document(doc)?);
        }
        Ok(out)
    }

    // read-modify-write guarded by the revision
    fn update<F>(&self, tx_id: &str, mut mutate: F) -> Result<Transaction, TransactionError>
    where
        F: FnMut(&mut Transaction) -> Result<(), TransactionError>,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut tx = self.get(tx_id)?;
            let revision = tx.revision;
            mutate(&mut tx)?;
            tx.revision = revision + 1;
            tx.updated_at = self.clock.now_secs();
            let filter = Filter::by_id(tx_id).eq("revision", revision);
            match self.store.update_one(TRANSACTION_COLLECTION, &filter, to_document(&tx)?, false)? {
                UpdateOutcome::Updated => return Ok(tx),
                _ => debug!("tx {}: revision {} is stale, retrying", tx_id, revision),
            }
        }
        Err(TransactionError::Contended(tx_id.to_string()))
    }

    /// Record the outcome of one channel
    pub fn report_progress(
        &self,
        tx_id: &str,
        channel_id: &ChannelId,
        progress: Progress,
    ) -> Result<Transaction, TransactionError> {
        let tx = self.update(tx_id, |tx| {
            tx.check_status("report progress", &[TransactionStatus::Pending])?;
            if !tx.target_channels.contains(channel_id) {
                return Err(TransactionError::UnknownChannel {
                    id: tx.id.clone(),
                    channel_id: channel_id.clone(),
                });
            }
            match &progress {
                Progress::Applied(_) => {
                    tx.failed_channels.retain(|f| &f.channel_id != channel_id);
                    if !tx.modified_channels.contains(channel_id) {
                        tx.modified_channels.push(channel_id.clone());
                    }
                }
                Progress::Failed(error) => {
                    tx.failed_channels.retain(|f| &f.channel_id != channel_id);
                    tx.failed_channels
                        .push(ChannelFailure { channel_id: channel_id.clone(), error: error.clone() });
                }
            }
            Ok(())
        })?;

        match progress {
            Progress::Applied(policy) => {
                if let Some(backup) = tx.backups.iter().find(|b| &b.channel_id == channel_id) {
                    self.backups.record_applied(&backup.backup_id, &policy)?;
                }
                debug!("tx {}: {} applied", tx_id, channel_id);
            }
            Progress::Failed(error) => warn!("tx {}: {} failed: {}", tx_id, channel_id, error),
        }
        Ok(tx)
    }

    /// Close a transaction with a status reflecting how many targets were changed
    #[instrument(skip(self))]
    pub fn commit(&self, tx_id: &str) -> Result<Transaction, TransactionError> {
        let now = self.clock.now_secs();
        let tx = self.update(tx_id, |tx| {
            tx.check_status("commit", &[TransactionStatus::Pending])?;
            let modified = tx.modified_channels.len();
            tx.status = if modified == 0 {
                TransactionStatus::Failed
            } else if modified < tx.target_channels.len() {
                TransactionStatus::Partial
            } else {
                TransactionStatus::Success
            };
            if tx.status != TransactionStatus::Success {
                let failed: Vec<_> = tx.failed_channels.iter().map(|f| f.channel_id.to_string()).collect();
                tx.error = Some(format!(
                    "{} of {} channels changed, failed: [{}]",
                    modified,
                    tx.target_channels.len(),
                    failed.join(", ")
                ));
            }
            tx.committed_at = Some(now);
            Ok(())
        })?;
        info!(
            "tx {} committed {} ({}/{} channels)",
            tx.id,
            tx.status,
            tx.modified_channels.len(),
            tx.target_channels.len()
        );
        Ok(tx)
    }

    /// Restore every backed up channel of a transaction.
    ///
    /// Each channel is restored independently.  The transaction is claimed as
    /// ROLLING_BACK first, so a concurrent rollback of the same transaction is
    /// refused.  It ends ROLLED_BACK when all restores succeed, FAILED
    /// otherwise.  In shadow mode the restores are only simulated and the
    /// transaction is left as it is.
    #[instrument(skip(self))]
    pub async fn rollback(&self, tx_id: &str, reason: &str) -> Result<RollbackReport, TransactionError> {
        const ELIGIBLE: &[TransactionStatus] = &[
            TransactionStatus::Pending,
            TransactionStatus::Success,
            TransactionStatus::Partial,
            TransactionStatus::Failed,
        ];
        if self.executor.is_dry_run() {
            let tx = self.get(tx_id)?;
            tx.check_status("roll back", ELIGIBLE)?;
            return Ok(self.simulate_rollback(&tx, reason));
        }

        let tx = self.update(tx_id, |tx| {
            tx.check_status("roll back", ELIGIBLE)?;
            tx.status = TransactionStatus::RollingBack;
            Ok(())
        })?;
        info!("tx {}: rolling back {} channel(s): {}", tx_id, tx.backups.len(), reason);

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for backup_ref in &tx.backups {
            match self.restore_one(&backup_ref.backup_id).await {
                Ok(()) => restored.push(backup_ref.channel_id.clone()),
                Err((reason, message)) => {
                    error!("tx {}: restore of {} failed: {}", tx_id, backup_ref.channel_id, message);
                    failed.push(RestoreFailure {
                        channel_id: backup_ref.channel_id.clone(),
                        backup_id: backup_ref.backup_id.clone(),
                        reason: reason.to_string(),
                        message,
                    });
                }
            }
        }

        let status =
            if failed.is_empty() { TransactionStatus::RolledBack } else { TransactionStatus::Failed };
        let now = self.clock.now_secs();
        self.update(tx_id, |tx| {
            tx.check_status("finish rollback", &[TransactionStatus::RollingBack])?;
            tx.status = status;
            tx.rollback_reason = Some(reason.to_string());
            tx.rolled_back_at = Some(now);
            for channel_id in &restored {
                if !tx.reverted_channels.contains(channel_id) {
                    tx.reverted_channels.push(channel_id.clone());
                }
            }
            if !failed.is_empty() {
                let names: Vec<_> = failed.iter().map(|f| f.channel_id.to_string()).collect();
                tx.error = Some(format!("rollback incomplete, not restored: [{}]", names.join(", ")));
            }
            Ok(())
        })?;

        let report =
            RollbackReport { transaction_id: tx_id.to_string(), status, restored, failed, dry_run: false };
        if report.is_complete() {
            info!("{}", report);
        } else {
            error!("{}", report);
        }
        Ok(report)
    }

    // checks every backup would restore, without touching the node or the store
    fn simulate_rollback(&self, tx: &Transaction, reason: &str) -> RollbackReport {
        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for backup_ref in &tx.backups {
            let checked = self
                .backups
                .get(&backup_ref.backup_id)
                .and_then(|backup| self.backups.restore_policy(&backup));
            match checked {
                Ok(policy) => {
                    info!(
                        "dry run: tx {} would restore {} to base {} msat, rate {} ppm",
                        tx.id, backup_ref.channel_id, policy.base_fee_msat, policy.fee_rate_ppm
                    );
                    restored.push(backup_ref.channel_id.clone());
                }
                Err(e) => failed.push(RestoreFailure {
                    channel_id: backup_ref.channel_id.clone(),
                    backup_id: backup_ref.backup_id.clone(),
                    reason: e.reason().to_string(),
                    message: e.to_string(),
                }),
            }
        }
        let report = RollbackReport {
            transaction_id: tx.id.clone(),
            status: tx.status,
            restored,
            failed,
            dry_run: true,
        };
        info!("{} ({})", report, reason);
        report
    }

    /// Restore one backup, after an integrity check
    pub(crate) async fn restore_one(&self, backup_id: &str) -> Result<(), (&'static str, String)> {
        let backup = self.backups.get(backup_id).map_err(|e| (e.reason(), e.to_string()))?;
        let policy = self.backups.restore_policy(&backup).map_err(|e| (e.reason(), e.to_string()))?;
        self.executor
            .restore(&backup.channel_id, &backup.channel_ref, &policy)
            .await
            .map(|_| ())
            .map_err(|e| (e.reason(), e.to_string()))
    }

    /// Record channels reverted outside a full rollback.  The status is unchanged.
    pub fn record_reverted(&self, tx_id: &str, channels: &[ChannelId]) -> Result<Transaction, TransactionError> {
        self.update(tx_id, |tx| {
            for channel_id in channels {
                if !tx.reverted_channels.contains(channel_id) {
                    tx.reverted_channels.push(channel_id.clone());
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, ExecutorConfig, ValidatorConfig};
    use crate::node::ClientError;
    use crate::persist::memory::MemoryStore;
    use crate::policy::validator::PolicyValidator;
    use crate::util::clock::ManualClock;
    use crate::util::test_utils::{make_channel, make_policy, MockNodeClient};
    use core::time::Duration;
    use test_log::test;

    struct Fixture {
        txm: TransactionManager,
        backups: Arc<BackupManager>,
        client: Arc<MockNodeClient>,
        channels: Vec<Channel>,
    }

    fn fixture(n: usize) -> Fixture {
        fixture_with(n, ExecutorConfig { base_delay_ms: 1, ..Default::default() })
    }

    fn fixture_with(n: usize, executor_config: ExecutorConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::from_secs(1_700_000_000));
        let client = Arc::new(MockNodeClient::new());
        let validator = Arc::new(PolicyValidator::new(ValidatorConfig::default(), clock.clone()));
        let executor = Arc::new(PolicyExecutor::new(executor_config, validator, client.clone()));
        let backups = Arc::new(BackupManager::new(BackupConfig::default(), store.clone(), clock.clone()));
        let txm = TransactionManager::new(
            TransactionConfig::default(),
            store,
            backups.clone(),
            executor,
            clock,
        );
        let channels: Vec<_> = (0..n)
            .map(|i| {
                let channel = make_channel(
                    &format!("c{}", i),
                    1_000_000,
                    500_000,
                    500_000,
                    make_policy(1000, 500),
                );
                client.add_channel(channel.clone());
                channel
            })
            .collect();
        Fixture { txm, backups, client, channels }
    }

    #[test]
    fn begin_backs_up_every_channel() {
        let f = fixture(3);
        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.target_channels.len(), 3);
        assert_eq!(tx.backups.len(), 3);
        let backups = f.backups.list_for_transaction(&tx.id).unwrap();
        assert_eq!(backups.len(), 3);
        assert_eq!(f.txm.get(&tx.id).unwrap(), tx);
    }

    #[test]
    fn commit_status_follows_modified() {
        let f = fixture(3);
        let applied = || Progress::Applied(make_policy(1000, 600));

        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        for c in &f.channels {
            f.txm.report_progress(&tx.id, &c.id, applied()).unwrap();
        }
        assert_eq!(f.txm.commit(&tx.id).unwrap().status, TransactionStatus::Success);

        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        f.txm.report_progress(&tx.id, &f.channels[0].id, applied()).unwrap();
        f.txm.report_progress(&tx.id, &f.channels[1].id, Progress::Failed("boom".into())).unwrap();
        let committed = f.txm.commit(&tx.id).unwrap();
        assert_eq!(committed.status, TransactionStatus::Partial);
        assert!(committed.error.unwrap().contains("c1"));

        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        assert_eq!(f.txm.commit(&tx.id).unwrap().status, TransactionStatus::Failed);
    }

    #[test]
    fn status_is_monotonic() {
        let f = fixture(1);
        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        f.txm.commit(&tx.id).unwrap();
        let err = f.txm.commit(&tx.id).unwrap_err();
        assert_eq!(err.reason(), "invalid_state");
        let err = f
            .txm
            .report_progress(&tx.id, &f.channels[0].id, Progress::Applied(make_policy(1, 1)))
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_state");
        assert_eq!(f.txm.commit("missing").unwrap_err(), TransactionError::NotFound("missing".into()));
    }

    #[test]
    fn progress_fills_backup() {
        let f = fixture(1);
        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        let err = f
            .txm
            .report_progress(&tx.id, &"other".into(), Progress::Failed("x".into()))
            .unwrap_err();
        assert_eq!(err.reason(), "unknown_channel");
        f.txm
            .report_progress(&tx.id, &f.channels[0].id, Progress::Applied(make_policy(1000, 600)))
            .unwrap();
        let backup = f.backups.get(&tx.backups[0].backup_id).unwrap();
        assert_eq!(backup.policy_after, Some(make_policy(1000, 600)));
    }

    #[test(tokio::test)]
    async fn rollback_restores_policy_before() {
        let f = fixture(2);
        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        for c in &f.channels {
            f.client.set_policy(&c.channel_ref, make_policy(1000, 700));
            f.txm.report_progress(&tx.id, &c.id, Progress::Applied(make_policy(1000, 700))).unwrap();
        }
        f.txm.commit(&tx.id).unwrap();

        let report = f.txm.rollback(&tx.id, "operator").await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.status, TransactionStatus::RolledBack);
        for c in &f.channels {
            assert_eq!(f.client.policy_of(&c.channel_ref), Some(make_policy(1000, 500)));
        }
        let stored = f.txm.get(&tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::RolledBack);
        assert_eq!(stored.rollback_reason.as_deref(), Some("operator"));
        assert_eq!(stored.reverted_channels.len(), 2);
        // terminal
        assert_eq!(f.txm.rollback(&tx.id, "again").await.unwrap_err().reason(), "invalid_state");
    }

    #[test(tokio::test)]
    async fn incomplete_rollback_fails() {
        let f = fixture(2);
        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        f.txm.commit(&tx.id).unwrap();
        f.client.fail_next(&f.channels[1].channel_ref, 3, ClientError::Transport("down".into()));

        let report = f.txm.rollback(&tx.id, "operator").await.unwrap();
        assert_eq!(report.status, TransactionStatus::Failed);
        assert_eq!(report.restored, vec![f.channels[0].id.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].reason, "execution_failed");
        let stored = f.txm.get(&tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.reverted_channels, vec![f.channels[0].id.clone()]);
        assert!(report.to_string().contains(&tx.id));

        // a failed rollback may be retried
        let report = f.txm.rollback(&tx.id, "retry").await.unwrap();
        assert_eq!(report.status, TransactionStatus::RolledBack);
    }

    #[test(tokio::test)]
    async fn concurrent_rollbacks_restore_once() {
        let f = fixture(2);
        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        for c in &f.channels {
            f.client.set_policy(&c.channel_ref, make_policy(1000, 700));
            f.txm.report_progress(&tx.id, &c.id, Progress::Applied(make_policy(1000, 700))).unwrap();
        }
        f.txm.commit(&tx.id).unwrap();
        f.client.set_delay(Some(Duration::from_millis(20)));

        let (first, second) = tokio::join!(f.txm.rollback(&tx.id, "auto"), f.txm.rollback(&tx.id, "manual"));
        let first = first.unwrap();
        assert_eq!(first.status, TransactionStatus::RolledBack);
        assert_eq!(second.unwrap_err().reason(), "invalid_state");
        for c in &f.channels {
            assert_eq!(f.client.calls_for(&c.channel_ref), 1);
            assert_eq!(f.client.policy_of(&c.channel_ref), Some(make_policy(1000, 500)));
        }
        let stored = f.txm.get(&tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::RolledBack);
        assert_eq!(stored.rollback_reason.as_deref(), Some("auto"));
    }

    #[test(tokio::test)]
    async fn rollback_in_shadow_mode_changes_nothing() {
        let f = fixture_with(2, ExecutorConfig { dry_run: true, base_delay_ms: 1, ..Default::default() });
        let tx = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        for c in &f.channels {
            f.client.set_policy(&c.channel_ref, make_policy(1000, 700));
            f.txm.report_progress(&tx.id, &c.id, Progress::Applied(make_policy(1000, 700))).unwrap();
        }
        f.txm.commit(&tx.id).unwrap();

        let report = f.txm.rollback(&tx.id, "operator").await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.status, TransactionStatus::Success);
        assert_eq!(report.restored.len(), 2);
        assert!(report.to_string().contains("dry run"));
        assert!(f.client.calls().is_empty());
        assert_eq!(f.client.policy_of(&f.channels[0].channel_ref), Some(make_policy(1000, 700)));

        let stored = f.txm.get(&tx.id).unwrap();
        assert_eq!(stored.status, TransactionStatus::Success);
        assert!(stored.reverted_channels.is_empty());
        assert_eq!(stored.rollback_reason, None);
    }

    #[test]
    fn list_newest_first() {
        let f = fixture(1);
        let first = f.txm.begin("node", &f.channels, OperationType::FeeUpdate).unwrap();
        let other = f.txm.begin("other", &f.channels, OperationType::Manual).unwrap();
        let listed = f.txm.list(Some("node"), 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(f.txm.list(None, 10).unwrap().len(), 2);
        let reverted = f.txm.record_reverted(&other.id, &[f.channels[0].id.clone()]).unwrap();
        assert_eq!(reverted.reverted_channels, vec![f.channels[0].id.clone()]);
        assert_eq!(reverted.status, TransactionStatus::Pending);
    }
}
