use core::time::Duration;

use async_trait::async_trait;
use feectl::channel::{Channel, FeePolicy};
use feectl::node::{ClientError, NodeApi};
use feectl::SendSync;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::*;
use url::Url;

use crate::convert::{
    policy_update_body, status_error, to_channel, ChannelEdge, ChannelsResponse,
    PolicyUpdateResponse,
};

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

fn default_url() -> String {
    "https://127.0.0.1:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings for an LND REST endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeClientConfig {
    /// Base URL of the REST listener
    #[serde(default = "default_url")]
    pub url: String,
    /// The admin macaroon, hex encoded
    #[serde(default)]
    pub macaroon_hex: String,
    /// Per request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Accept the node's self-signed certificate
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        NodeClientConfig {
            url: default_url(),
            macaroon_hex: String::new(),
            timeout_secs: default_timeout_secs(),
            accept_invalid_certs: false,
        }
    }
}

/// A [`NodeApi`] over the LND REST interface
#[derive(Clone, Debug)]
pub struct RestNodeClient {
    http: Client,
    base: Url,
    timeout_secs: u64,
}

impl SendSync for RestNodeClient {}

impl RestNodeClient {
    /// Create a client.  No request is made until the first call.
    pub fn new(config: &NodeClientConfig) -> Result<Self, ClientError> {
        let mut url = config.url.clone();
        // so that joins extend the path instead of replacing the last segment
        if !url.ends_with('/') {
            url.push('/');
        }
        let base = Url::parse(&url)
            .map_err(|e| ClientError::Rejected(format!("invalid node url {}: {}", config.url, e)))?;
        let mut headers = HeaderMap::new();
        if !config.macaroon_hex.is_empty() {
            if !config.macaroon_hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ClientError::Rejected("macaroon is not hex".to_string()));
            }
            let mut value = HeaderValue::from_str(&config.macaroon_hex)
                .map_err(|e| ClientError::Rejected(format!("macaroon: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(MACAROON_HEADER, value);
        }
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(RestNodeClient { http, base, timeout_secs: config.timeout_secs })
    }

    /// The base URL requests are made against
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base.join(path).map_err(|e| ClientError::Rejected(format!("{}: {}", path, e)))
    }

    fn map_send_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(self.timeout_secs)
        } else if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let res = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let text = res.text().await.map_err(|e| self.map_send_error(e))?;
        serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path)?;
        trace!("GET {}", url);
        self.send(self.http.get(url)).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ClientError> {
        let url = self.url(path)?;
        trace!("POST {}", url);
        self.send(self.http.post(url).json(body)).await
    }
}

#[async_trait]
impl NodeApi for RestNodeClient {
    #[instrument(skip(self, policy))]
    async fn update_channel_policy(
        &self,
        channel_ref: &str,
        policy: &FeePolicy,
    ) -> Result<(), ClientError> {
        let body = policy_update_body(channel_ref, policy)?;
        let res: PolicyUpdateResponse = self.post("v1/chanpolicy", &body).await?;
        res.into_result(channel_ref)?;
        debug!("updated policy of {} to {}ppm", channel_ref, policy.fee_rate_ppm);
        Ok(())
    }

    async fn get_channel(&self, channel_ref: &str) -> Result<Channel, ClientError> {
        let listing: ChannelsResponse = self.get("v1/channels").await?;
        let active = listing
            .channels
            .into_iter()
            .find(|c| c.channel_point == channel_ref)
            .ok_or_else(|| ClientError::NotFound(channel_ref.to_string()))?;
        let edge: ChannelEdge = self.get(&format!("v1/graph/edge/{}", active.chan_id)).await?;
        to_channel(&active, &edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: NodeClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, NodeClientConfig::default());
        assert_eq!(config.timeout_secs, 30);
        assert!(serde_json::from_str::<NodeClientConfig>(r#"{"uri": "x"}"#).is_err());
    }

    #[test]
    fn base_url_gets_a_trailing_slash() {
        let config =
            NodeClientConfig { url: "https://node.local:8080/lnd".to_string(), ..Default::default() };
        let client = RestNodeClient::new(&config).unwrap();
        assert_eq!(client.url("v1/channels").unwrap().as_str(), "https://node.local:8080/lnd/v1/channels");
    }

    #[test]
    fn bad_settings_are_rejected() {
        let bad_url = NodeClientConfig { url: "not a url".to_string(), ..Default::default() };
        assert!(matches!(RestNodeClient::new(&bad_url), Err(ClientError::Rejected(_))));
        let bad_macaroon = NodeClientConfig { macaroon_hex: "zz\n".to_string(), ..Default::default() };
        assert!(matches!(RestNodeClient::new(&bad_macaroon), Err(ClientError::Rejected(_))));
        let ok = NodeClientConfig { macaroon_hex: "0201036c6e64".to_string(), ..Default::default() };
        assert!(RestNodeClient::new(&ok).is_ok());
    }
}
