//! Fixtures and scriptable collaborators for tests

use core::time::Duration;

use async_trait::async_trait;

use crate::channel::{Channel, ChannelId, FeePolicy};
use crate::decision::HeuristicScores;
use crate::node::{ClientError, NodeApi, Notifier};
use crate::prelude::*;
use crate::rollback::{MetricsSource, PostChangeMetrics};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A policy with the given fees and fixed routing parameters
pub fn make_policy(base_fee_msat: u64, fee_rate_ppm: u64) -> FeePolicy {
    FeePolicy {
        base_fee_msat,
        fee_rate_ppm,
        time_lock_delta: 40,
        min_htlc_msat: 1000,
        max_htlc_msat: Some(990_000_000),
    }
}

/// A channel with a derived peer and channel point
pub fn make_channel(id: &str, capacity: u64, local: u64, remote: u64, policy: FeePolicy) -> Channel {
    Channel::new(
        ChannelId::new(id),
        format!("peer-{}", id),
        format!("{}:0", hex::encode(id)),
        capacity,
        local,
        remote,
        policy,
    )
    .expect("valid channel")
}

/// Scores that make the decision engine propose a fee increase on a balanced channel
pub fn increase_scores() -> HeuristicScores {
    HeuristicScores { activity: 0.8, ..HeuristicScores::uniform(0.75) }
}

struct Failure {
    remaining: u32,
    error: ClientError,
}

/// A remote node held in memory.
///
/// Every update is logged.  Updates to a channel can be made to fail a number
/// of times, and reads can be made unavailable.
#[derive(Default)]
pub struct MockNodeClient {
    channels: Mutex<OrderedMap<String, Channel>>,
    failures: Mutex<OrderedMap<String, Failure>>,
    calls: Mutex<Vec<(String, FeePolicy)>>,
    reads_unavailable: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
}

impl SendSync for MockNodeClient {}

impl MockNodeClient {
    /// An empty node
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel
    pub fn add_channel(&self, channel: Channel) {
        lock(&self.channels).insert(channel.channel_ref.clone(), channel);
    }

    /// Change the live policy of a channel behind the control plane's back
    pub fn set_policy(&self, channel_ref: &str, policy: FeePolicy) {
        if let Some(channel) = lock(&self.channels).get_mut(channel_ref) {
            channel.policy = policy;
        }
    }

    /// The live policy of a channel
    pub fn policy_of(&self, channel_ref: &str) -> Option<FeePolicy> {
        lock(&self.channels).get(channel_ref).map(|c| c.policy.clone())
    }

    /// Fail the next `count` updates of a channel
    pub fn fail_next(&self, channel_ref: &str, count: u32, error: ClientError) {
        lock(&self.failures).insert(channel_ref.to_string(), Failure { remaining: count, error });
    }

    /// Make reads fail
    pub fn set_reads_unavailable(&self, unavailable: bool) {
        *lock(&self.reads_unavailable) = unavailable;
    }

    /// Delay every update
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// Every update received, in order
    pub fn calls(&self) -> Vec<(String, FeePolicy)> {
        lock(&self.calls).clone()
    }

    /// Updates received for one channel
    pub fn calls_for(&self, channel_ref: &str) -> usize {
        lock(&self.calls).iter().filter(|(r, _)| r == channel_ref).count()
    }
}

#[async_trait]
impl NodeApi for MockNodeClient {
    async fn update_channel_policy(
        &self,
        channel_ref: &str,
        policy: &FeePolicy,
    ) -> Result<(), ClientError> {
        lock(&self.calls).push((channel_ref.to_string(), policy.clone()));
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = lock(&self.failures);
            if let Some(failure) = failures.get_mut(channel_ref) {
                if failure.remaining > 0 {
                    failure.remaining -= 1;
                    return Err(failure.error.clone());
                }
            }
        }
        match lock(&self.channels).get_mut(channel_ref) {
            Some(channel) => {
                channel.policy = policy.clone();
                Ok(())
            }
            None => Err(ClientError::NotFound(channel_ref.to_string())),
        }
    }

    async fn get_channel(&self, channel_ref: &str) -> Result<Channel, ClientError> {
        if *lock(&self.reads_unavailable) {
            return Err(ClientError::Transport("reads disabled".to_string()));
        }
        lock(&self.channels)
            .get(channel_ref)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(channel_ref.to_string()))
    }
}

/// A notifier that keeps every alert
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl SendSync for RecordingNotifier {}

impl RecordingNotifier {
    /// An empty notifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_alert(&self, message: &str) -> Result<(), ClientError> {
        lock(&self.messages).push(message.to_string());
        Ok(())
    }
}

/// Metrics played back from a script.  The last entry repeats.
pub struct ScriptedMetrics {
    script: Vec<PostChangeMetrics>,
    calls: Mutex<usize>,
    stall: bool,
}

impl SendSync for ScriptedMetrics {}

impl ScriptedMetrics {
    /// Play back the given metrics
    pub fn new(script: Vec<PostChangeMetrics>) -> Self {
        ScriptedMetrics { script, calls: Mutex::new(0), stall: false }
    }

    /// A source whose collections never finish
    pub fn stalled() -> Self {
        ScriptedMetrics { script: Vec::new(), calls: Mutex::new(0), stall: true }
    }

    /// Collections started so far
    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn collect(&self, _transaction_id: &str) -> Result<PostChangeMetrics, ClientError> {
        let index = {
            let mut calls = lock(&self.calls);
            *calls += 1;
            *calls - 1
        };
        if self.stall {
            futures::future::pending::<()>().await;
        }
        let last = self.script.len().checked_sub(1);
        match last {
            Some(last) => Ok(self.script[index.min(last)].clone()),
            None => Err(ClientError::Transport("no metrics scripted".to_string())),
        }
    }
}
