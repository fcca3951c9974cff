//! HTTP surface of the storing service.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use castore_storage::{CreateOptions, File};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::StreamReader;

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::node::Node;
use crate::peer::{
    ReplicaAccepted, ReplicaPush, ReplicaVolumes, HEADER_CREATED_AT, HEADER_OWNER, HEADER_REPLICA,
    HEADER_SIGNATURE, HEADER_TTL,
};

/// Query of `PUT /files/*key`.
#[derive(Debug, Default, Deserialize)]
pub struct PutParams {
    /// Total copies wanted; the node default applies when absent.
    pub replica: Option<u32>,
    /// Lifetime in seconds.
    pub ttl: Option<u64>,
}

impl PutParams {
    fn options(&self, default_replica: u32) -> CreateOptions {
        CreateOptions::with_replica(self.replica.unwrap_or(default_replica))
            .ttl(Duration::from_secs(self.ttl.unwrap_or(0)))
    }
}

/// Storing service API state.
pub struct StoreApi {
    node: Arc<Node>,
    config: Arc<NodeConfig>,
}

impl StoreApi {
    /// Creates the API over `node`.
    pub fn new(node: Arc<Node>, config: Arc<NodeConfig>) -> Self {
        Self { node, config }
    }

    /// Builds the router.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                "/files/*key",
                get(get_file_handler)
                    .head(head_file_handler)
                    .put(put_file_handler)
                    .delete(delete_file_handler),
            )
            .route("/replicas/*key", put(put_replica_handler))
            .route(
                "/replica-volumes/*key",
                get(get_replica_volumes_handler)
                    .put(put_replica_volumes_handler)
                    .delete(delete_replica_volumes_handler),
            )
            .route("/config", get(config_handler))
            .route("/health", get(health_handler))
            .layer(DefaultBodyLimit::disable())
            .with_state(self)
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

async fn put_file_handler(
    State(api): State<Arc<StoreApi>>,
    Path(key): Path<String>,
    Query(params): Query<PutParams>,
    request: Request,
) -> NodeResult<(StatusCode, Json<File>)> {
    let opts = params.options(api.node.default_replica());
    let file = if is_multipart(request.headers()) {
        let mut multipart = Multipart::from_request(request, &api)
            .await
            .map_err(|e| NodeError::BadRequest(e.body_text()))?;
        let field = multipart
            .next_field()
            .await
            .map_err(|e| NodeError::BadRequest(e.body_text()))?
            .ok_or_else(|| NodeError::BadRequest("multipart upload without parts".into()))?;
        let chunks = field.map_err(|e| io::Error::other(e.to_string()));
        api.node
            .create_file(&key, StreamReader::new(Box::pin(chunks)), opts)
            .await?
    } else {
        let chunks = request.into_body().into_data_stream().map_err(io::Error::other);
        api.node
            .create_file(&key, StreamReader::new(Box::pin(chunks)), opts)
            .await?
    };
    Ok((StatusCode::CREATED, Json(file)))
}

async fn get_file_handler(State(api): State<Arc<StoreApi>>, Path(key): Path<String>) -> NodeResult<Response> {
    let stream = api.node.get_file(&key).await?;
    Ok((StatusCode::OK, Body::from_stream(stream)).into_response())
}

async fn head_file_handler(State(api): State<Arc<StoreApi>>, Path(key): Path<String>) -> NodeResult<Response> {
    match api.node.has_file(&key).await? {
        Some(signature) => Ok((StatusCode::NO_CONTENT, [(HEADER_SIGNATURE, signature)]).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

async fn delete_file_handler(State(api): State<Arc<StoreApi>>, Path(key): Path<String>) -> NodeResult<StatusCode> {
    api.node.delete_file(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> NodeResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| NodeError::BadRequest(format!("header {} is not text", name)))
        })
        .transpose()
}

fn replica_push(headers: &HeaderMap) -> NodeResult<ReplicaPush> {
    let ttl = match header_str(headers, HEADER_TTL)? {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| NodeError::BadRequest(format!("invalid ttl {:?}", raw)))?,
        None => 0,
    };
    let created_at = match header_str(headers, HEADER_CREATED_AT)? {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|_| NodeError::BadRequest(format!("invalid created_at {:?}", raw)))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let replica = match header_str(headers, HEADER_REPLICA)? {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| NodeError::BadRequest(format!("invalid replica {:?}", raw)))?,
        None => 0,
    };
    Ok(ReplicaPush {
        ttl: Duration::from_secs(ttl),
        created_at,
        owner: header_str(headers, HEADER_OWNER)?.unwrap_or_default().to_string(),
        signature: header_str(headers, HEADER_SIGNATURE)?.unwrap_or_default().to_string(),
        replica,
    })
}

async fn put_replica_handler(
    State(api): State<Arc<StoreApi>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> NodeResult<(StatusCode, Json<ReplicaAccepted>)> {
    let push = replica_push(&headers)?;
    let chunks = body.into_data_stream().map_err(io::Error::other);
    let accepted = api
        .node
        .create_replica(&key, StreamReader::new(Box::pin(chunks)), &push)
        .await?;
    let status = if accepted.deferred {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(accepted)))
}

async fn put_replica_volumes_handler(
    State(api): State<Arc<StoreApi>>,
    Path(key): Path<String>,
    Json(body): Json<ReplicaVolumes>,
) -> NodeResult<StatusCode> {
    api.node
        .update_file_replica(&key, &body.volume_ids, body.original_count)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_replica_volumes_handler(
    State(api): State<Arc<StoreApi>>,
    Path(key): Path<String>,
) -> NodeResult<Json<ReplicaVolumes>> {
    Ok(Json(api.node.replica_volumes(&key).await?))
}

/// Query of `DELETE /replica-volumes/*key`.
#[derive(Debug, Deserialize)]
pub struct ReleaseParams {
    /// Volume that gave up its copy.
    pub volume_id: String,
}

async fn delete_replica_volumes_handler(
    State(api): State<Arc<StoreApi>>,
    Path(key): Path<String>,
    Query(params): Query<ReleaseParams>,
) -> NodeResult<StatusCode> {
    api.node.release_holder(&key, &params.volume_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn config_handler(State(api): State<Arc<StoreApi>>) -> Json<NodeConfig> {
    Json(api.config.as_ref().clone())
}

async fn health_handler(State(api): State<Arc<StoreApi>>) -> Json<serde_json::Value> {
    let volumes: Vec<&str> = api.node.volumes().iter().map(|v| v.id()).collect();
    Json(serde_json::json!({
        "status": "ok",
        "node": api.node.name(),
        "volumes": volumes,
    }))
}
