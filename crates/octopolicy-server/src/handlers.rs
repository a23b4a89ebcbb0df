use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use octopolicy_bundle::ExportedBundle;
use octopolicy_core::{Error, ImportConfig, PolicyFilter, PolicyId, Subscriber};
use octopolicy_engine::EvaluateRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const EVALUATION_ID_HEADER: &str = "x-evaluation-id";
pub const CACHE_TTL_HEADER: &str = "x-cache-ttl";

type PolicyPath = Path<(String, String, String, String)>;

fn policy_id(Path((repository, group, name, version)): PolicyPath) -> PolicyId {
    PolicyId::new(repository, group, name, version)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError(Error::bad_request(format!("invalid {name} header"))))
        })
        .transpose()
}

pub async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "up"}))
}

/// Ready when the store answers a point read.
pub async fn readiness(State(state): State<AppState>) -> Response {
    match state.storage.get_data("readiness-probe").await {
        Ok(_) => Json(json!({
            "status": "up",
            "storage": state.storage.backend_name(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "down", "error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn evaluate(
    State(state): State<AppState>,
    path: PolicyPath,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let input: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body)?
    };

    let mut request = EvaluateRequest::new(policy_id(path), input);
    if let Some(id) = header_str(&headers, EVALUATION_ID_HEADER)? {
        request = request.with_evaluation_id(id);
    }
    if let Some(ttl) = header_str(&headers, CACHE_TTL_HEADER)? {
        let ttl = ttl
            .parse::<u64>()
            .map_err(|_| ApiError(Error::bad_request("x-cache-ttl must be whole seconds")))?;
        request = request.with_ttl(ttl);
    }

    // Cancelled when the client goes away and axum drops this future.
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();
    let evaluation = state.policies.evaluate(request, token).await?;

    let mut response = Json(evaluation.result).into_response();
    if let Ok(etag) = HeaderValue::from_str(&evaluation.etag) {
        response.headers_mut().insert(header::ETAG, etag);
    }
    Ok(response)
}

pub async fn lock(State(state): State<AppState>, path: PolicyPath) -> ApiResult<StatusCode> {
    state.policies.lock(&policy_id(path)).await?;
    Ok(StatusCode::OK)
}

pub async fn unlock(State(state): State<AppState>, path: PolicyPath) -> ApiResult<StatusCode> {
    state.policies.unlock(&policy_id(path)).await?;
    Ok(StatusCode::OK)
}

pub async fn export(State(state): State<AppState>, path: PolicyPath) -> ApiResult<Response> {
    let bundle = state.bundles.export(&policy_id(path)).await?;
    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static(ExportedBundle::CONTENT_TYPE),
        ),
        (
            header::CONTENT_LENGTH,
            HeaderValue::from(bundle.content_length()),
        ),
        (
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&bundle.content_disposition())
                .map_err(|e| ApiError(Error::internal(e.to_string())))?,
        ),
    ];
    Ok((headers, bundle.bytes).into_response())
}

pub async fn import(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<PolicyId>> {
    if body.is_empty() {
        return Err(ApiError(Error::bad_request("bundle body is empty")));
    }
    let policy = state.bundles.import(&body).await?;
    Ok(Json(policy.id))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    #[serde(rename = "webhookURL")]
    pub webhook_url: String,
    pub subscriber: String,
}

/// Register a webhook notified when the policy changes.
pub async fn subscribe(
    State(state): State<AppState>,
    path: PolicyPath,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Subscriber>)> {
    let request: SubscribeRequest = serde_json::from_slice(&body)?;
    if request.webhook_url.is_empty() || request.subscriber.is_empty() {
        return Err(ApiError(Error::bad_request(
            "webhookURL and subscriber are required",
        )));
    }
    let id = policy_id(path);
    state.storage.get_policy(&id).await?;

    let subscriber = state
        .storage
        .add_subscriber(Subscriber::new(id, request.webhook_url, request.subscriber))
        .await?;
    Ok((StatusCode::CREATED, Json(subscriber)))
}

#[derive(Debug, Deserialize)]
pub struct ImportConfigRequest {
    #[serde(rename = "policyURL")]
    pub policy_url: String,
    /// Humantime duration such as `"1h"` or `"30m"`.
    pub interval: String,
}

pub async fn save_import_config(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ImportConfig>> {
    let request: ImportConfigRequest = serde_json::from_slice(&body)?;
    if request.policy_url.is_empty() {
        return Err(ApiError(Error::bad_request("policyURL is required")));
    }
    let interval: Duration = humantime::parse_duration(&request.interval)
        .map_err(|e| ApiError(Error::bad_request(format!("invalid interval: {e}"))))?;
    if interval.is_zero() {
        return Err(ApiError(Error::bad_request("interval must be positive")));
    }

    let config = state
        .storage
        .save_import_config(ImportConfig::new(request.policy_url, interval))
        .await?;
    Ok(Json(config))
}

pub async fn list_import_configs(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ImportConfig>>> {
    Ok(Json(state.storage.list_import_configs().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPoliciesQuery {
    pub locked: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySummary {
    #[serde(flatten)]
    pub id: PolicyId,
    pub locked: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: time::OffsetDateTime,
}

pub async fn list_policies(
    State(state): State<AppState>,
    Query(query): Query<ListPoliciesQuery>,
) -> ApiResult<Json<Vec<PolicySummary>>> {
    let filter = PolicyFilter {
        locked: query.locked,
    };
    let policies = state.storage.list_policies(filter).await?;
    Ok(Json(
        policies
            .into_iter()
            .map(|p| PolicySummary {
                id: p.id,
                locked: p.locked,
                last_update: p.last_update,
            })
            .collect(),
    ))
}
