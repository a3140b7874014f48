use std::sync::Arc;

use serde::Serialize;

use crate::domain::Order;
use crate::gateway::{GatewayEvent, GatewayKind};
use crate::orchestrator::{
    Completion, LifecycleAuditEvent, LifecycleError, SubscriptionOrchestrator, TransitionOutcome,
};
use crate::store::SubscriptionStore;

/// What a webhook delivery did.
///
/// Ordered by significance so a batch reports its most significant result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Event kind this service does not act on.
    Ignored,
    /// No order or subscription matched; logged and discarded.
    Unmatched,
    /// Already applied by an earlier delivery.
    Duplicate,
    Processed,
}

/// Applies verified gateway notifications to local subscription state.
///
/// Signature verification always happens before any field of the payload
/// is read. Events are matched to orders by transaction id, then by the
/// reference embedded at checkout. Nothing is ever applied to a "most
/// recent" order by guesswork.
pub struct WebhookReconciler<S: SubscriptionStore> {
    orchestrator: Arc<SubscriptionOrchestrator<S>>,
}

impl<S: SubscriptionStore> Clone for WebhookReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<S: SubscriptionStore> WebhookReconciler<S> {
    pub fn new(orchestrator: Arc<SubscriptionOrchestrator<S>>) -> Self {
        Self { orchestrator }
    }

    /// Header carrying the signature for `gateway`, if it uses one.
    pub fn signature_header(&self, gateway: GatewayKind) -> Option<&'static str> {
        self.orchestrator
            .gateways()
            .get(gateway)
            .and_then(|adapter| adapter.signature_header())
    }

    /// Like [`handle`](Self::handle), resolving the gateway from its name.
    pub async fn handle_named(
        &self,
        gateway: &str,
        raw: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, LifecycleError> {
        let kind: GatewayKind = gateway.parse().map_err(|_| LifecycleError::UnknownGateway {
            name: gateway.to_string(),
        })?;
        self.handle(kind, raw, signature).await
    }

    pub async fn handle(
        &self,
        gateway: GatewayKind,
        raw: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, LifecycleError> {
        let adapter = self
            .orchestrator
            .gateways()
            .get(gateway)
            .ok_or_else(|| LifecycleError::UnknownGateway {
                name: gateway.to_string(),
            })?;

        if !adapter.verify_webhook(raw, signature) {
            tracing::warn!(
                target: "tollway::security",
                gateway = %gateway,
                body_len = raw.len(),
                "Webhook signature verification failed"
            );
            self.orchestrator
                .audit(LifecycleAuditEvent::WebhookRejected { gateway })
                .await;
            return Err(LifecycleError::InvalidWebhookSignature { gateway });
        }

        let events = adapter.parse_webhook(raw).map_err(|err| {
            tracing::warn!(
                target: "tollway::security",
                gateway = %gateway,
                error = %err,
                "Verified webhook could not be parsed"
            );
            LifecycleError::from_gateway(gateway, err)
        })?;

        let mut summary = WebhookOutcome::Ignored;
        for event in events {
            let outcome = self.apply(gateway, event).await?;
            summary = summary.max(outcome);
        }
        Ok(summary)
    }

    async fn apply(&self, gateway: GatewayKind, event: GatewayEvent) -> Result<WebhookOutcome, LifecycleError> {
        let event_type = event.kind().to_string();
        tracing::debug!(
            target: "tollway::webhooks",
            gateway = %gateway,
            event_type = %event_type,
            "Applying webhook event"
        );

        match event {
            GatewayEvent::PaymentCompleted {
                transaction_id,
                order_reference,
                subscription_id,
                period_end,
            } => {
                let order = self
                    .match_order(gateway, transaction_id.as_deref(), order_reference.as_deref())
                    .await?;

                if let Some(order) = order {
                    if order.is_completed() {
                        tracing::debug!(
                            target: "tollway::webhooks",
                            gateway = %gateway,
                            order_id = %order.id,
                            "Duplicate completion ignored"
                        );
                        return Ok(WebhookOutcome::Duplicate);
                    }
                    let completion = Completion {
                        transaction_id,
                        subscription_id,
                        period_end,
                    };
                    let outcome = self
                        .orchestrator
                        .complete_order(&order.user_id, order.id, completion)
                        .await?;
                    return Ok(Self::classify(gateway, &outcome));
                }

                // Recurring charges carry no order of ours; treat as renewal.
                if let Some(subscription_id) = subscription_id {
                    if let Some(outcome) = self
                        .renew(gateway, &subscription_id, transaction_id.clone(), period_end)
                        .await?
                    {
                        return Ok(outcome);
                    }
                }

                let identifier = transaction_id.or(order_reference).unwrap_or_default();
                self.unmatched(gateway, &event_type, &identifier).await
            }

            GatewayEvent::SubscriptionRenewed {
                subscription_id,
                transaction_id,
                period_end,
            } => match self
                .renew(gateway, &subscription_id, transaction_id, period_end)
                .await?
            {
                Some(outcome) => Ok(outcome),
                None => self.unmatched(gateway, &event_type, &subscription_id).await,
            },

            GatewayEvent::SubscriptionCanceled { subscription_id } => {
                let user = self
                    .orchestrator
                    .store()
                    .find_user_by_subscription_id(gateway, &subscription_id)
                    .await?;
                let Some(user_id) = user else {
                    return self.unmatched(gateway, &event_type, &subscription_id).await;
                };

                match self
                    .orchestrator
                    .confirm_cancellation(&user_id, Some(&subscription_id))
                    .await?
                {
                    Some(outcome) => Ok(Self::classify(gateway, &outcome)),
                    None => self.unmatched(gateway, &event_type, &subscription_id).await,
                }
            }

            GatewayEvent::Ignored { kind } => {
                tracing::debug!(
                    target: "tollway::webhooks",
                    gateway = %gateway,
                    event_type = %kind,
                    "Webhook event ignored"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Order of `gateway` identified by transaction id, else by reference.
    async fn match_order(
        &self,
        gateway: GatewayKind,
        transaction_id: Option<&str>,
        reference: Option<&str>,
    ) -> Result<Option<Order>, LifecycleError> {
        let store = self.orchestrator.store();

        if let Some(txid) = transaction_id {
            if let Some(order) = store.find_order_by_transaction_id(gateway, txid).await? {
                return Ok(Some(order));
            }
        }

        if let Some(reference) = reference.filter(|r| !r.is_empty()) {
            if let Some(order) = store.find_order_by_reference(reference).await? {
                if order.gateway == Some(gateway) {
                    return Ok(Some(order));
                }
                tracing::warn!(
                    target: "tollway::security",
                    gateway = %gateway,
                    order_id = %order.id,
                    order_gateway = ?order.gateway,
                    "Order reference presented by the wrong gateway"
                );
            }
        }

        Ok(None)
    }

    async fn renew(
        &self,
        gateway: GatewayKind,
        subscription_id: &str,
        transaction_id: Option<String>,
        period_end: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Option<WebhookOutcome>, LifecycleError> {
        let Some(user_id) = self
            .orchestrator
            .store()
            .find_user_by_subscription_id(gateway, subscription_id)
            .await?
        else {
            return Ok(None);
        };

        let outcome = self
            .orchestrator
            .record_renewal(&user_id, subscription_id, transaction_id, period_end)
            .await?;
        Ok(outcome.map(|o| Self::classify(gateway, &o)))
    }

    fn classify(gateway: GatewayKind, outcome: &TransitionOutcome) -> WebhookOutcome {
        match outcome {
            TransitionOutcome::Duplicate { .. } => WebhookOutcome::Duplicate,
            TransitionOutcome::Stale { order_id, status } => {
                tracing::warn!(
                    target: "tollway::webhooks",
                    gateway = %gateway,
                    order_id = %order_id,
                    status = %status,
                    "Completion for an order that is no longer open"
                );
                WebhookOutcome::Ignored
            }
            _ => WebhookOutcome::Processed,
        }
    }

    async fn unmatched(
        &self,
        gateway: GatewayKind,
        event_type: &str,
        identifier: &str,
    ) -> Result<WebhookOutcome, LifecycleError> {
        tracing::warn!(
            target: "tollway::security",
            gateway = %gateway,
            event_type = %event_type,
            identifier = %identifier,
            "Webhook event matched no order or subscription"
        );
        self.orchestrator
            .audit(LifecycleAuditEvent::WebhookUnmatched {
                gateway,
                event_type: event_type.to_string(),
                identifier: identifier.to_string(),
            })
            .await;
        Ok(WebhookOutcome::Unmatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_summary_prefers_processed() {
        let outcomes = [
            WebhookOutcome::Ignored,
            WebhookOutcome::Processed,
            WebhookOutcome::Unmatched,
        ];
        let summary = outcomes
            .into_iter()
            .fold(WebhookOutcome::Ignored, WebhookOutcome::max);
        assert_eq!(summary, WebhookOutcome::Processed);
        assert!(WebhookOutcome::Duplicate > WebhookOutcome::Unmatched);
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WebhookOutcome::Duplicate).unwrap(),
            serde_json::json!("duplicate")
        );
    }
}
