//! HTTP client for the storing service of a peer node.
//!
//! A peer exposes the same file surface as a local volume minus the internal
//! queue operations; this client is the remote half of that capability split.

use std::io;
use std::time::Duration;

use castore_storage::ByteStream;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NodeError, NodeResult};

/// Response header carrying the content signature of a key.
pub const HEADER_SIGNATURE: &str = "x-castore-signature";
/// Replica push header: lifetime in seconds.
pub const HEADER_TTL: &str = "ttl";
/// Replica push header: owner creation time, RFC3339.
pub const HEADER_CREATED_AT: &str = "created_at";
/// Replica push header: volume id of the owner.
pub const HEADER_OWNER: &str = "x-castore-volume-id";
/// Replica push header: total copies the owner asked for.
pub const HEADER_REPLICA: &str = "x-castore-replica";

/// Default deadline of every peer call.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata sent along with a replica push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPush {
    /// Lifetime from `created_at`; zero never expires.
    pub ttl: Duration,
    /// Creation time recorded by the owner.
    pub created_at: DateTime<Utc>,
    /// Volume id of the owner, used to fetch the bytes again on retry.
    pub owner: String,
    /// Content signature, when known.
    pub signature: String,
    /// Total copies the owner asked for.
    pub replica: u32,
}

/// Answer of a peer to a replica push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAccepted {
    /// Volume that holds, or will hold, the copy.
    pub volume_id: String,
    /// True when the write failed and was queued for retry.
    #[serde(default)]
    pub deferred: bool,
}

/// Body of `PUT /replica-volumes/*key` and answer of `GET /replica-volumes/*key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaVolumes {
    /// Every volume known to hold the content.
    pub volume_ids: Vec<String>,
    /// Total copies requested for the content.
    pub original_count: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Percent-encodes every `/`-separated segment of a key.
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Client for one peer node.
#[derive(Debug, Clone)]
pub struct PeerClient {
    name: String,
    base_url: String,
    client: Client,
}

impl PeerClient {
    /// Creates a client for `base_url` (`http://host:port`).
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(name, base_url, client)
    }

    /// Creates a client sharing an existing connection pool.
    pub fn with_client(name: impl Into<String>, base_url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Peer node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base URL of the peer.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, route: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, route, encode_key(key))
    }

    fn unreachable(&self, e: reqwest::Error) -> NodeError {
        NodeError::PeerUnreachable {
            peer: self.name.clone(),
            msg: e.to_string(),
        }
    }

    async fn check(&self, response: Response) -> NodeResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let msg = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("error").to_string(),
        };
        Err(NodeError::Remote {
            peer: self.name.clone(),
            status: status.as_u16(),
            msg,
        })
    }

    /// Returns the signature if the peer holds `key` on one of its volumes.
    pub async fn has_file(&self, key: &str) -> NodeResult<Option<String>> {
        let response = self
            .client
            .head(self.url("files", key))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response).await?;
        let signature = response
            .headers()
            .get(HEADER_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Some(signature))
    }

    /// Streams the content of `key` from the peer.
    pub async fn get_file(&self, key: &str) -> NodeResult<ByteStream> {
        let response = self
            .client
            .get(self.url("files", key))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let response = self.check(response).await?;
        Ok(Box::pin(response.bytes_stream().map_err(io::Error::other)))
    }

    /// Stores `body` under `key` on the peer.
    pub async fn create_file(&self, key: &str, body: ByteStream, replica: Option<u32>) -> NodeResult<()> {
        let mut request = self
            .client
            .put(self.url("files", key))
            .body(reqwest::Body::wrap_stream(body));
        if let Some(replica) = replica {
            request = request.query(&[("replica", replica)]);
        }
        let response = request.send().await.map_err(|e| self.unreachable(e))?;
        self.check(response).await?;
        Ok(())
    }

    /// Deletes `key` on the peer.
    pub async fn delete_file(&self, key: &str) -> NodeResult<()> {
        let response = self
            .client
            .delete(self.url("files", key))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.check(response).await?;
        Ok(())
    }

    /// Pushes a replica of `key` and returns the accepting volume.
    pub async fn create_replica(&self, key: &str, body: ByteStream, push: &ReplicaPush) -> NodeResult<ReplicaAccepted> {
        let response = self
            .client
            .put(self.url("replicas", key))
            .header(HEADER_TTL, push.ttl.as_secs().to_string())
            .header(HEADER_CREATED_AT, push.created_at.to_rfc3339())
            .header(HEADER_OWNER, push.owner.as_str())
            .header(HEADER_SIGNATURE, push.signature.as_str())
            .header(HEADER_REPLICA, push.replica.to_string())
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let response = self.check(response).await?;
        let accepted: ReplicaAccepted = response.json().await.map_err(|e| self.unreachable(e))?;
        debug!(peer = %self.name, key = %key, volume = %accepted.volume_id, deferred = accepted.deferred, "replica pushed");
        Ok(accepted)
    }

    /// Tells the peer which volumes hold the content of `key`.
    pub async fn update_file_replica(&self, key: &str, volume_ids: &[String], original_count: u32) -> NodeResult<()> {
        let body = ReplicaVolumes {
            volume_ids: volume_ids.to_vec(),
            original_count,
        };
        let response = self
            .client
            .put(self.url("replica-volumes", key))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.check(response).await?;
        Ok(())
    }

    /// Every volume the peer knows to hold `key`, its own included.
    pub async fn replica_volumes(&self, key: &str) -> NodeResult<ReplicaVolumes> {
        let response = self
            .client
            .get(self.url("replica-volumes", key))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let response = self.check(response).await?;
        response.json().await.map_err(|e| self.unreachable(e))
    }

    /// Tells the owner of `key` that `volume_id` gave up its copy.
    pub async fn release_holder(&self, key: &str, volume_id: &str) -> NodeResult<()> {
        let response = self
            .client
            .delete(self.url("replica-volumes", key))
            .query(&[("volume_id", volume_id)])
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.check(response).await?;
        debug!(peer = %self.name, key = %key, volume = %volume_id, "holder released");
        Ok(())
    }

    /// Returns the peer's health document.
    pub async fn health(&self) -> NodeResult<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let response = self.check(response).await?;
        response.json().await.map_err(|e| self.unreachable(e))
    }
}
