use feectl::channel::{Channel, ChannelId, FeePolicy};
use feectl::node::ClientError;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

// LND renders 64 bit integers as JSON strings
fn u64_from_json<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }
    match Repr::deserialize(d)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Response of `GET /v1/channels`
#[derive(Debug, Deserialize)]
pub(crate) struct ChannelsResponse {
    #[serde(default)]
    pub channels: Vec<ActiveChannel>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActiveChannel {
    #[serde(deserialize_with = "u64_from_json")]
    pub chan_id: u64,
    pub channel_point: String,
    pub remote_pubkey: String,
    #[serde(deserialize_with = "u64_from_json")]
    pub capacity: u64,
    #[serde(default, deserialize_with = "u64_from_json")]
    pub local_balance: u64,
    #[serde(default, deserialize_with = "u64_from_json")]
    pub remote_balance: u64,
}

/// Response of `GET /v1/graph/edge/{chan_id}`
#[derive(Debug, Deserialize)]
pub(crate) struct ChannelEdge {
    pub node1_pub: String,
    #[allow(unused)]
    pub node2_pub: String,
    pub node1_policy: Option<RoutingPolicy>,
    pub node2_policy: Option<RoutingPolicy>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoutingPolicy {
    #[serde(default)]
    pub time_lock_delta: u32,
    #[serde(default, deserialize_with = "u64_from_json")]
    pub min_htlc: u64,
    #[serde(default, deserialize_with = "u64_from_json")]
    pub fee_base_msat: u64,
    #[serde(default, deserialize_with = "u64_from_json")]
    pub fee_rate_milli_msat: u64,
    #[serde(default, deserialize_with = "u64_from_json")]
    pub max_htlc_msat: u64,
}

impl From<&RoutingPolicy> for FeePolicy {
    fn from(p: &RoutingPolicy) -> Self {
        FeePolicy {
            base_fee_msat: p.fee_base_msat,
            fee_rate_ppm: p.fee_rate_milli_msat,
            time_lock_delta: p.time_lock_delta,
            min_htlc_msat: p.min_htlc,
            // zero means unset
            max_htlc_msat: if p.max_htlc_msat == 0 { None } else { Some(p.max_htlc_msat) },
        }
    }
}

/// Response of `POST /v1/chanpolicy`
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PolicyUpdateResponse {
    #[serde(default)]
    pub failed_updates: Vec<FailedUpdate>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FailedUpdate {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub update_error: String,
}

impl PolicyUpdateResponse {
    pub fn into_result(self, channel_ref: &str) -> Result<(), ClientError> {
        if self.failed_updates.is_empty() {
            return Ok(());
        }
        let reasons: Vec<_> = self
            .failed_updates
            .iter()
            .map(|f| format!("{} {}", f.reason, f.update_error).trim().to_string())
            .collect();
        Err(ClientError::Rejected(format!("{}: {}", channel_ref, reasons.join("; "))))
    }
}

/// Split a channel point into funding txid and output index
pub(crate) fn parse_channel_point(channel_ref: &str) -> Result<(&str, u32), ClientError> {
    let invalid = || ClientError::Rejected(format!("invalid channel point {:?}", channel_ref));
    let (txid, index) = channel_ref.rsplit_once(':').ok_or_else(invalid)?;
    if txid.len() != 64 || !txid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let index = index.parse().map_err(|_| invalid())?;
    Ok((txid, index))
}

/// The body of a `POST /v1/chanpolicy` request
pub(crate) fn policy_update_body(channel_ref: &str, policy: &FeePolicy) -> Result<Value, ClientError> {
    let (txid, output_index) = parse_channel_point(channel_ref)?;
    let mut body = json!({
        "chan_point": { "funding_txid_str": txid, "output_index": output_index },
        "base_fee_msat": policy.base_fee_msat.to_string(),
        "fee_rate_ppm": policy.fee_rate_ppm,
        "time_lock_delta": policy.time_lock_delta,
        "min_htlc_msat": policy.min_htlc_msat.to_string(),
        "min_htlc_msat_specified": true,
    });
    if let Some(max) = policy.max_htlc_msat {
        body["max_htlc_msat"] = json!(max.to_string());
    }
    Ok(body)
}

/// Build a channel snapshot from the channel listing and its graph edge
pub(crate) fn to_channel(active: &ActiveChannel, edge: &ChannelEdge) -> Result<Channel, ClientError> {
    // our side is the node that is not the peer
    let ours = if edge.node1_pub == active.remote_pubkey {
        edge.node2_policy.as_ref()
    } else {
        edge.node1_policy.as_ref()
    };
    let policy = ours.ok_or_else(|| {
        ClientError::Decode(format!("no local policy on edge {}", active.chan_id))
    })?;
    Channel::new(
        ChannelId::new(active.chan_id.to_string()),
        active.remote_pubkey.clone(),
        active.channel_point.clone(),
        active.capacity,
        active.local_balance,
        active.remote_balance,
        FeePolicy::from(policy),
    )
    .map_err(|e| ClientError::Decode(format!("channel {}: {}", active.chan_id, e)))
}

/// Classify an unsuccessful HTTP status
pub(crate) fn status_error(status: StatusCode, body: &str) -> ClientError {
    let message = format!("{} {}", status, body.trim());
    if status == StatusCode::NOT_FOUND {
        ClientError::NotFound(message)
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ClientError::Transport(message)
    } else {
        ClientError::Rejected(message)
    }
}
