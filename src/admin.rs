//! Admin REST surface: inspect breakers and health entries, enumerate
//! cluster members, and force-close breakers.

use crate::breaker::{BreakerRecord, BreakerStatus};
use crate::cluster::ClusterCoordinator;
use crate::health::{HealthKey, HealthRegistry, HealthSnapshot};
use crate::recovery::RecoveryHandler;
use crate::registry::BreakerRegistry;
use crate::scheduler::ProbeScheduler;
use crate::subscription::{DeliveryType, ProbeMethod, SubscriptionProjection, SubscriptionView};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<dyn BreakerRegistry>,
    pub view: Arc<SubscriptionView>,
    pub health: Arc<HealthRegistry>,
    pub scheduler: Arc<ProbeScheduler>,
    pub recovery: Arc<RecoveryHandler>,
    pub cluster: Arc<dyn ClusterCoordinator>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/circuit-breakers", get(list_breakers).delete(close_breakers))
        .route("/circuit-breakers/{subscription_id}", get(get_breaker))
        .route("/health-checks", get(list_health_checks))
        .route("/pods", get(list_pods))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    page: Option<usize>,
    size: Option<usize>,
}

async fn list_breakers(
    State(state): State<AdminState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<BreakerRecord>>, StatusCode> {
    let status = match params.status.as_deref() {
        Some(text) => Some(BreakerStatus::parse(text).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let page = params.page.unwrap_or(0);
    let size = params.size.unwrap_or(20).clamp(1, 500);
    let records = state
        .registry
        .get_paged(page, size, status, None)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(records))
}

async fn get_breaker(
    State(state): State<AdminState>,
    Path(subscription_id): Path<String>,
) -> Result<Json<BreakerRecord>, StatusCode> {
    match state.registry.get(&subscription_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseRequest {
    subscription_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseResponse {
    subscriber_ids_not_found_in_subscription_cache: Vec<String>,
}

/// Force-close breakers: every subscription gets one republish cycle and its
/// breaker removed. Refused as a whole when any id is unknown (404), already
/// republishing (409), or still unclaimed OPEN (425).
async fn close_breakers(
    State(state): State<AdminState>,
    Json(request): Json<CloseRequest>,
) -> Result<Json<CloseResponse>, StatusCode> {
    let mut records = Vec::with_capacity(request.subscription_ids.len());
    for subscription_id in &request.subscription_ids {
        match state.registry.get(subscription_id).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => return Err(StatusCode::NOT_FOUND),
            Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
    if records.iter().any(|record| record.status == BreakerStatus::Republishing) {
        return Err(StatusCode::CONFLICT);
    }
    if records.iter().any(|record| record.status == BreakerStatus::Open) {
        return Err(StatusCode::TOO_EARLY);
    }

    let mut not_in_cache = Vec::new();
    for record in records {
        let subscription_id = record.subscription_id.clone();
        let projection = match state.view.get(&subscription_id) {
            Some(projection) => projection,
            None => {
                not_in_cache.push(subscription_id.clone());
                synthesize_projection(&record)
            }
        };

        let url = projection.callback_url.clone().unwrap_or_else(|| record.callback_url.clone());
        let key = HealthKey::new(url, projection.probe_method);
        let emptied = state.health.remove(&key, &subscription_id);
        if emptied {
            state.health.set_thread_open(&key, false);
            state.scheduler.cancel(&key);
        }

        tracing::info!(subscription = %subscription_id, "force close requested");
        if state.recovery.republish_subscription(&subscription_id).await.is_err() {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        state.recovery.close_if_republishing(&subscription_id).await;
    }

    Ok(Json(CloseResponse { subscriber_ids_not_found_in_subscription_cache: not_in_cache }))
}

/// A stand-in projection built from the breaker record when the cache has no
/// entry for the subscription anymore.
fn synthesize_projection(record: &BreakerRecord) -> SubscriptionProjection {
    SubscriptionProjection {
        subscription_id: record.subscription_id.clone(),
        publisher_id: String::new(),
        subscriber_id: record.subscriber_id.clone(),
        environment: record.environment.clone(),
        callback_url: Some(record.callback_url.clone()),
        delivery_type: DeliveryType::Callback,
        probe_method: ProbeMethod::Head,
        circuit_breaker_opt_out: false,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthParams {
    callback_url: Option<String>,
    http_method: Option<String>,
}

async fn list_health_checks(
    State(state): State<AdminState>,
    Query(params): Query<HealthParams>,
) -> Result<Json<Vec<HealthSnapshot>>, StatusCode> {
    let method = match params.http_method.as_deref() {
        Some(text) => Some(ProbeMethod::parse(text).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let snapshots: Vec<HealthSnapshot> = state
        .health
        .snapshots()
        .into_iter()
        .filter(|snapshot| {
            params
                .callback_url
                .as_deref()
                .is_none_or(|url| snapshot.key.callback_url == url)
        })
        .filter(|snapshot| method.is_none_or(|m| snapshot.key.method == m))
        .collect();
    if snapshots.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(snapshots))
}

async fn list_pods(State(state): State<AdminState>) -> Result<Json<Vec<String>>, StatusCode> {
    state.cluster.members().await.map(Json).map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}
