use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::channel::{Channel, ChannelId, FeePolicy};
use crate::config::BackupConfig;
use crate::persist::{self, from_document, to_document, Document, Filter, Sort, Store};
use crate::Arc;
use crate::util::clock::Clock;
use crate::util::codec::{compress, content_hash, decompress, from_base64, to_base64};

const DAY_SECS: u64 = 24 * 3600;

/// Storage class of a backup, advancing with age
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTier {
    /// recent, stored as plain text
    Hot,
    /// compressed
    Warm,
    /// compressed, deleted when the retention window ends
    Cold,
}

impl BackupTier {
    /// All tiers, youngest first
    pub const ALL: [BackupTier; 3] = [BackupTier::Hot, BackupTier::Warm, BackupTier::Cold];

    /// The collection holding this tier
    pub fn collection(&self) -> &'static str {
        match self {
            BackupTier::Hot => "backups/hot",
            BackupTier::Warm => "backups/warm",
            BackupTier::Cold => "backups/cold",
        }
    }

    /// Whether payloads in this tier are compressed
    pub fn is_compressed(&self) -> bool {
        !matches!(self, BackupTier::Hot)
    }
}

impl Display for BackupTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupTier::Hot => "hot",
            BackupTier::Warm => "warm",
            BackupTier::Cold => "cold",
        };
        f.write_str(s)
    }
}

/// A snapshot of a channel policy taken before a change.
///
/// `payload` holds the canonical bytes of the policy, as text in the hot tier
/// and base64 gzip in the others.  `checksum` is the content hash of the
/// uncompressed bytes and never changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// backup id
    #[serde(rename = "_id")]
    pub id: String,
    /// the transaction the backup was taken for, if any
    pub transaction_id: Option<String>,
    /// the managed node
    pub node_id: Option<String>,
    /// the channel
    pub channel_id: ChannelId,
    /// the remote API reference of the channel
    pub channel_ref: String,
    /// the stored policy
    pub payload: String,
    /// the policy set after the backup was taken
    pub policy_after: Option<FeePolicy>,
    /// content hash of the uncompressed payload
    pub checksum: String,
    /// current tier
    pub tier: BackupTier,
    /// creation time, seconds since the epoch
    pub created_at: u64,
    /// deletion time, seconds since the epoch
    pub expires_at: u64,
}

/// Errors from the backup store
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BackupError {
    /// The stored payload does not match its checksum
    #[error("backup {backup_id} of channel {channel_id} failed its integrity check")]
    Integrity {
        /// the backup
        backup_id: String,
        /// the channel
        channel_id: ChannelId,
    },
    /// Unknown backup
    #[error("backup {0} not found")]
    NotFound(String),
    /// A backup with the same id is already stored
    #[error("backup {0} already exists")]
    AlreadyExists(String),
    /// The payload could not be encoded or decoded
    #[error("backup {backup_id}: {message}")]
    Codec {
        /// the backup
        backup_id: String,
        /// what went wrong
        message: String,
    },
    /// The store failed
    #[error(transparent)]
    Persist(#[from] persist::Error),
}

impl BackupError {
    /// A stable, machine checkable reason
    pub fn reason(&self) -> &'static str {
        match self {
            BackupError::Integrity { .. } => "integrity_mismatch",
            BackupError::NotFound(_) => "not_found",
            BackupError::AlreadyExists(_) => "already_exists",
            BackupError::Codec { .. } => "codec",
            BackupError::Persist(e) => e.reason(),
        }
    }
}

/// What one retention sweep did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// backups moved from hot to warm
    pub to_warm: usize,
    /// backups moved from warm to cold
    pub to_cold: usize,
    /// cold backups deleted
    pub deleted: usize,
}

/// Tiered storage of policy snapshots
pub struct BackupManager {
    config: BackupConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    /// Create a backup manager
    pub fn new(config: BackupConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        BackupManager { config, store, clock }
    }

    /// Snapshot the current policy of a channel into the hot tier
    #[instrument(skip(self, channel), fields(channel_id = %channel.id))]
    pub fn create(
        &self,
        channel: &Channel,
        transaction_id: Option<&str>,
        node_id: Option<&str>,
    ) -> Result<Backup, BackupError> {
        let now = self.clock.now_secs();
        let bytes = channel.policy.canonical_bytes();
        let payload = String::from_utf8(bytes).map_err(|e| BackupError::Codec {
            backup_id: String::new(),
            message: e.to_string(),
        })?;
        let backup = Backup {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.map(str::to_string),
            node_id: node_id.map(str::to_string),
            channel_id: channel.id.clone(),
            channel_ref: channel.channel_ref.clone(),
            checksum: content_hash(payload.as_bytes()),
            payload,
            policy_after: None,
            tier: BackupTier::Hot,
            created_at: now,
            expires_at: now + self.config.cold_days * DAY_SECS,
        };
        self.store.insert_one(BackupTier::Hot.collection(), to_document(&backup)?)?;
        debug!("created backup {}", backup.id);
        Ok(backup)
    }

    /// Find a backup in any tier
    pub fn get(&self, backup_id: &str) -> Result<Backup, BackupError> {
        for tier in BackupTier::ALL {
            if let Some(doc) = self.store.find_one(tier.collection(), &Filter::by_id(backup_id))? {
                return Ok(from_document(doc)?);
            }
        }
        Err(BackupError::NotFound(backup_id.to_string()))
    }

    /// The uncompressed payload of a backup
    pub fn read_payload(&self, backup: &Backup) -> Result<Vec<u8>, BackupError> {
        if !backup.tier.is_compressed() {
            return Ok(backup.payload.as_bytes().to_vec());
        }
        let codec_err =
            |e: std::io::Error| BackupError::Codec { backup_id: backup.id.clone(), message: e.to_string() };
        let compressed = from_base64(&backup.payload).map_err(codec_err)?;
        decompress(&compressed).map_err(codec_err)
    }

    /// Whether the stored payload still matches its checksum
    pub fn verify_integrity(&self, backup_id: &str) -> Result<bool, BackupError> {
        let backup = self.get(backup_id)?;
        Ok(self.check(&backup))
    }

    fn check(&self, backup: &Backup) -> bool {
        match self.read_payload(backup) {
            Ok(bytes) => content_hash(&bytes) == backup.checksum,
            Err(e) => {
                warn!("backup {} unreadable: {}", backup.id, e);
                false
            }
        }
    }

    /// The policy stored in a backup, after an integrity check
    pub fn restore_policy(&self, backup: &Backup) -> Result<FeePolicy, BackupError> {
        let integrity = || BackupError::Integrity {
            backup_id: backup.id.clone(),
            channel_id: backup.channel_id.clone(),
        };
        let bytes = self.read_payload(backup).map_err(|_| integrity())?;
        if content_hash(&bytes) != backup.checksum {
            error!("backup {} of {} failed its integrity check", backup.id, backup.channel_id);
            return Err(integrity());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::Codec { backup_id: backup.id.clone(), message: e.to_string() })
    }

    /// Record the policy applied after the backup was taken
    pub fn record_applied(&self, backup_id: &str, policy_after: &FeePolicy) -> Result<(), BackupError> {
        let backup = self.get(backup_id)?;
        let mut set = Document::new();
        set.insert("policy_after".to_string(), serde_json::to_value(policy_after).map_err(|e| {
            BackupError::Codec { backup_id: backup_id.to_string(), message: e.to_string() }
        })?);
        self.store.update_one(backup.tier.collection(), &Filter::by_id(backup_id), set, false)?;
        Ok(())
    }

    /// Move backups to colder tiers by age, and delete expired ones.
    ///
    /// Tiers are processed youngest first, so one sweep brings every backup
    /// to its final tier and a repeated sweep does nothing.
    #[instrument(skip(self))]
    pub fn apply_retention(&self) -> Result<RetentionReport, BackupError> {
        let now = self.clock.now_secs();
        let aged = |days: u64| now.saturating_sub(days * DAY_SECS);
        let mut report = RetentionReport::default();

        for backup in self.older_than(BackupTier::Hot, aged(self.config.hot_days))? {
            let compressed = compress(backup.payload.as_bytes()).map_err(|e| BackupError::Codec {
                backup_id: backup.id.clone(),
                message: e.to_string(),
            })?;
            let moved = Backup { payload: to_base64(&compressed), tier: BackupTier::Warm, ..backup };
            self.move_to(BackupTier::Hot, moved)?;
            report.to_warm += 1;
        }

        for backup in self.older_than(BackupTier::Warm, aged(self.config.warm_days))? {
            let moved = Backup { tier: BackupTier::Cold, ..backup };
            self.move_to(BackupTier::Warm, moved)?;
            report.to_cold += 1;
        }

        for backup in self.older_than(BackupTier::Cold, aged(self.config.cold_days))? {
            report.deleted +=
                self.store.delete_many(BackupTier::Cold.collection(), &Filter::by_id(&backup.id))?;
        }

        if report != RetentionReport::default() {
            info!(
                "retention: {} to warm, {} to cold, {} deleted",
                report.to_warm, report.to_cold, report.deleted
            );
        }
        Ok(report)
    }

    fn older_than(&self, tier: BackupTier, cutoff: u64) -> Result<Vec<Backup>, BackupError> {
        let docs = self.store.find(tier.collection(), &Filter::all(), Some(&Sort::asc("created_at")), None)?;
        let mut out = Vec::new();
        for doc in docs {
            let backup: Backup = from_document(doc)?;
            if backup.created_at < cutoff {
                out.push(backup);
            }
        }
        Ok(out)
    }

    fn move_to(&self, from: BackupTier, moved: Backup) -> Result<(), BackupError> {
        match self.store.insert_one(moved.tier.collection(), to_document(&moved)?) {
            // left behind by an interrupted sweep
            Err(persist::Error::AlreadyExists(_)) => {}
            other => other?,
        }
        self.store.delete_many(from.collection(), &Filter::by_id(&moved.id))?;
        debug!("moved backup {} from {} to {}", moved.id, from, moved.tier);
        Ok(())
    }

    /// Serialize a backup for transfer to another environment
    pub fn export(&self, backup_id: &str) -> Result<String, BackupError> {
        let backup = self.get(backup_id)?;
        serde_json::to_string(&backup)
            .map_err(|e| BackupError::Codec { backup_id: backup_id.to_string(), message: e.to_string() })
    }

    /// Store an exported backup after checking its integrity
    pub fn import(&self, exported: &str) -> Result<Backup, BackupError> {
        let backup: Backup = serde_json::from_str(exported).map_err(|e| BackupError::Codec {
            backup_id: String::new(),
            message: e.to_string(),
        })?;
        if !self.check(&backup) {
            return Err(BackupError::Integrity {
                backup_id: backup.id,
                channel_id: backup.channel_id,
            });
        }
        match self.get(&backup.id) {
            Ok(_) => return Err(BackupError::AlreadyExists(backup.id)),
            Err(BackupError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.insert_one(backup.tier.collection(), to_document(&backup)?)?;
        info!("imported backup {} of {}", backup.id, backup.channel_id);
        Ok(backup)
    }

    /// The most recent backup of a channel, across all tiers
    pub fn get_latest(
        &self,
        channel_id: &ChannelId,
        node_id: Option<&str>,
    ) -> Result<Option<Backup>, BackupError> {
        let mut filter = Filter::all().eq("channel_id", channel_id.as_str());
        if let Some(node_id) = node_id {
            filter = filter.eq("node_id", node_id);
        }
        let sort = Sort::desc("created_at");
        let mut latest: Option<Backup> = None;
        for tier in BackupTier::ALL {
            for doc in self.store.find(tier.collection(), &filter, Some(&sort), Some(1))? {
                let backup: Backup = from_document(doc)?;
                if latest.as_ref().map_or(true, |l| backup.created_at > l.created_at) {
                    latest = Some(backup);
                }
            }
        }
        Ok(latest)
    }

    /// The backups taken for a transaction, oldest first
    pub fn list_for_transaction(&self, transaction_id: &str) -> Result<Vec<Backup>, BackupError> {
        let filter = Filter::all().eq("transaction_id", transaction_id);
        let mut out = Vec::new();
        for tier in BackupTier::ALL {
            for doc in self.store.find(tier.collection(), &filter, None, None)? {
                out.push(from_document::<Backup>(doc)?);
            }
        }
        out.sort_by_key(|b| b.created_at);
        Ok(out)
    }
}
