//! Matrix REST API
//!
//! Wire types and the [`GridApi`] seam the sync session talks through.
//! [`HttpGridApi`] is the real client; tests substitute their own.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use racerconf::ConnectionConfig;

use crate::error::{ApiError, Result};
use crate::model::{IoPath, Node, NodeId, NodeStatus, SyncToken};

/// Protocol string the handshake must report.
pub const PROTOCOL_VERSION: &str = "SR2-API-1.0";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend operating mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// Nodes are refetched one by one when their sync token moves.
    #[default]
    Standard,
    /// The whole node map is refetched at once.
    Simulator,
}

impl ApiMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(ApiMode::Standard),
            "simulator" => Some(ApiMode::Simulator),
            _ => None,
        }
    }
}

impl fmt::Display for ApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiMode::Standard => write!(f, "standard"),
            ApiMode::Simulator => write!(f, "simulator"),
        }
    }
}

/// `GET /api/meta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMeta {
    pub protocol: String,
    #[serde(default)]
    pub version: String,
    pub mode: String,
}

impl ApiMeta {
    /// Check the protocol version and return the operating mode.
    pub fn validate(&self) -> Result<ApiMode> {
        if self.protocol != PROTOCOL_VERSION {
            return Err(ApiError::ProtocolVersion {
                found: self.protocol.clone(),
                expected: PROTOCOL_VERSION,
            });
        }
        ApiMode::parse(&self.mode).ok_or_else(|| ApiError::UnsupportedMode(self.mode.clone()))
    }
}

/// `GET /srnet/transient`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    pub local_node_id: NodeId,
    #[serde(default)]
    pub root_node_id: Option<NodeId>,
    #[serde(default)]
    pub routing_token: SyncToken,
    pub node_tokens: Vec<(NodeId, SyncToken)>,
    /// Malformed entries are dropped; the tokens above still apply.
    #[serde(default, deserialize_with = "lenient_node_status")]
    pub node_status: Vec<NodeStatus>,
}

fn lenient_node_status<'de, D>(deserializer: D) -> std::result::Result<Vec<NodeStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            warn!("ignoring node_status that is not a list: {}", other);
            return Ok(Vec::new());
        }
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<NodeStatus>(entry) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("ignoring malformed node status: {}", e);
                None
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrosspointAction {
    Create,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crosspoint {
    pub input: IoPath,
    pub output: IoPath,
}

/// `POST /srnet/grid/crosspoints`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosspointBatch {
    pub action: CrosspointAction,
    pub points: Vec<Crosspoint>,
}

impl CrosspointBatch {
    pub fn single(action: CrosspointAction, input: IoPath, output: IoPath) -> Self {
        Self {
            action,
            points: vec![Crosspoint { input, output }],
        }
    }
}

/// One element of `POST /srnet/io/rename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameEntry {
    pub path: IoPath,
    pub name: String,
}

/// Everything the sync session needs from the matrix.
#[async_trait]
pub trait GridApi: Send + Sync {
    async fn meta(&self) -> Result<ApiMeta>;

    async fn transient(&self) -> Result<Transient>;

    /// A single node tree.
    async fn node(&self, id: &str) -> Result<Node>;

    /// The full node map, keyed by node id.
    async fn nodes(&self) -> Result<HashMap<NodeId, Node>>;

    async fn crosspoints(&self, batch: &CrosspointBatch) -> Result<()>;

    async fn rename(&self, entries: &[RenameEntry]) -> Result<()>;
}

/// reqwest-backed [`GridApi`].
#[derive(Debug, Clone)]
pub struct HttpGridApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpGridApi {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(connection.accept_invalid_certs())
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: connection.base_url(),
            token: connection.bearer_token().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn request(&self, method: Method, endpoint: &str) -> (RequestBuilder, String) {
        let url = self.url(endpoint);
        let request = self.client.request(method, &url).bearer_auth(&self.token);
        (request, url)
    }

    async fn execute(&self, method: &'static str, url: String, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

        if !response.status().is_success() {
            return Err(ApiError::Status {
                method,
                url,
                status: response.status().as_u16(),
            });
        }

        debug!(method, %url, "request ok");
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<T> {
        let (mut request, url) = self.request(Method::GET, endpoint);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = self.execute("GET", url.clone(), request).await?;
        let text = response.text().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

        serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn post_json<B: Serialize + ?Sized + Sync>(&self, endpoint: &str, body: &B) -> Result<()> {
        let (request, url) = self.request(Method::POST, endpoint);
        self.execute("POST", url, request.json(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl GridApi for HttpGridApi {
    async fn meta(&self) -> Result<ApiMeta> {
        self.get_json("/api/meta", &[]).await
    }

    async fn transient(&self) -> Result<Transient> {
        self.get_json("/srnet/transient", &[]).await
    }

    async fn node(&self, id: &str) -> Result<Node> {
        self.get_json("/srnet/node", &[("id", id)]).await
    }

    async fn nodes(&self) -> Result<HashMap<NodeId, Node>> {
        self.get_json("/srnet/nodes", &[]).await
    }

    async fn crosspoints(&self, batch: &CrosspointBatch) -> Result<()> {
        self.post_json("/srnet/grid/crosspoints", batch).await
    }

    async fn rename(&self, entries: &[RenameEntry]) -> Result<()> {
        self.post_json("/srnet/io/rename", entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(protocol: &str, mode: &str) -> ApiMeta {
        ApiMeta {
            protocol: protocol.to_string(),
            version: "2.4.1".to_string(),
            mode: mode.to_string(),
        }
    }

    #[test]
    fn test_meta_validate() {
        assert_eq!(meta(PROTOCOL_VERSION, "standard").validate().unwrap(), ApiMode::Standard);
        assert_eq!(meta(PROTOCOL_VERSION, "simulator").validate().unwrap(), ApiMode::Simulator);

        assert!(matches!(
            meta("SR2-API-0.9", "standard").validate(),
            Err(ApiError::ProtocolVersion { .. })
        ));
        assert!(matches!(
            meta(PROTOCOL_VERSION, "replay").validate(),
            Err(ApiError::UnsupportedMode(m)) if m == "replay"
        ));
    }

    #[test]
    fn test_crosspoint_body() {
        let batch = CrosspointBatch::single(
            CrosspointAction::Delete,
            IoPath::from("n-1/SDI/2"),
            IoPath::from("n-2/SDI/1"),
        );
        assert_eq!(
            serde_json::to_value(&batch).unwrap(),
            json!({"action": "delete", "points": [{"input": "n-1/SDI/2", "output": "n-2/SDI/1"}]})
        );
    }

    #[test]
    fn test_transient_without_status() {
        let transient: Transient = serde_json::from_value(json!({
            "local_node_id": "n-1",
            "root_node_id": "n-1",
            "routing_token": 77,
            "node_tokens": [["n-1", 3], ["n-2", 9]]
        }))
        .unwrap();

        assert_eq!(transient.node_tokens, vec![("n-1".to_string(), 3), ("n-2".to_string(), 9)]);
        assert!(transient.node_status.is_empty());
    }

    #[test]
    fn test_malformed_status_keeps_tokens() {
        let transient: Transient = serde_json::from_value(json!({
            "local_node_id": "n-1",
            "node_tokens": [["n-1", 5], ["n-2", 6]],
            "node_status": [
                {"node_id": "n-1", "temperatures": [{"name": "fpga", "celsius": null}]},
                {"node_id": "n-2", "io_state": {"madi_in": [-1, 0]}},
                {"io_state": {"sdi": 1}},
                {"node_id": "n-2", "io_state": {"sdi": 4}}
            ]
        }))
        .unwrap();

        assert_eq!(transient.node_tokens, vec![("n-1".to_string(), 5), ("n-2".to_string(), 6)]);
        assert_eq!(transient.node_status.len(), 1);
        assert_eq!(transient.node_status[0].node_id, "n-2");
    }

    #[test]
    fn test_status_not_a_list() {
        let transient: Transient = serde_json::from_value(json!({
            "local_node_id": "n-1",
            "node_tokens": [["n-1", 5]],
            "node_status": {"n-1": {}}
        }))
        .unwrap();
        assert!(transient.node_status.is_empty());

        let transient: Transient = serde_json::from_value(json!({
            "local_node_id": "n-1",
            "node_tokens": [],
            "node_status": null
        }))
        .unwrap();
        assert!(transient.node_status.is_empty());
    }

    #[test]
    fn test_http_client_base_url() {
        let connection = ConnectionConfig {
            host: "10.0.0.5/".to_string(),
            use_https: false,
            api_token: " SRK_abcdefghij ".to_string(),
        };
        let api = HttpGridApi::new(&connection).unwrap();
        assert_eq!(api.base_url(), "http://10.0.0.5");
        assert_eq!(api.url("/api/meta"), "http://10.0.0.5/api/meta");
    }
}
