use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::reconciler::WebhookReconciler;
use crate::error::{Result, TollwayError};
use crate::gateway::GatewayKind;
use crate::store::SubscriptionStore;

/// Router exposing `POST /api/webhooks/:gateway`.
pub fn webhook_router<S: SubscriptionStore>(reconciler: Arc<WebhookReconciler<S>>) -> Router {
    Router::new()
        .route("/api/webhooks/:gateway", post(receive_webhook::<S>))
        .with_state(reconciler)
}

async fn receive_webhook<S: SubscriptionStore>(
    State(reconciler): State<Arc<WebhookReconciler<S>>>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let kind: GatewayKind = gateway
        .parse()
        .map_err(|_| TollwayError::not_found(format!("unknown gateway '{}'", gateway)))?;

    let signature = reconciler
        .signature_header(kind)
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let outcome = reconciler.handle(kind, &body, signature).await?;
    Ok(Json(json!({ "outcome": outcome })))
}
