#![crate_name = "feectl"]

//! A control plane for changing Lightning channel fee policies safely.
//!
//! Channel telemetry is turned into proposals by the [`decision::DecisionEngine`],
//! gated by the [`policy::validator::PolicyValidator`], and applied against the
//! remote node by the [`executor::PolicyExecutor`] inside a transaction managed by
//! the [`transaction::TransactionManager`].  Every targeted channel is snapshotted
//! by the [`backup::BackupManager`] first, so the [`rollback::RollbackOrchestrator`]
//! can always undo an applied change.
//!
//! See [`control::ControlPlane`] for the entry point that wires these together.

#![forbid(unsafe_code)]
#![allow(bare_trait_objects)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

/// Snapshots of channel policies in tiered storage
pub mod backup;
/// Channels and fee policies
pub mod channel;
/// Configuration
pub mod config;
/// Wiring of the components and the decision cycle
pub mod control;
/// Scores to decisions
pub mod decision;
/// Application of policy changes against the remote node
pub mod executor;
/// Remote node and notification interfaces
pub mod node;
/// Persistence
pub mod persist;
/// Policy enforcement
pub mod policy;
/// Rollback coordination
pub mod rollback;
/// Multi-channel transactions
pub mod transaction;
/// Various utilities
pub mod util;

pub use std::sync::Arc;

/// Common imports
pub mod prelude {
    pub use std::collections::BTreeMap as OrderedMap;
    pub use std::collections::BTreeSet as OrderedSet;
    pub use std::sync::{Mutex, MutexGuard};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;
