use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::signal;

use crate::config::Config;
use crate::error::{Result, TollwayError};
use crate::gateway::{
    FastSpringAdapter, GatewayError, GatewayRegistry, PaddleAdapter, PayProGlobalAdapter,
};
use crate::orchestrator::{
    AbuseGate, OrchestratorSettings, Provisioner, SubscriptionOrchestrator, TracingAuditSink,
};
use crate::provisioning::HttpProvisioningClient;
use crate::retry::RetryExecutor;
use crate::scheduler::{RunnerHandle, ScheduledTransitionRunner};
use crate::store::SubscriptionStore;
use crate::webhooks::{webhook_router, WebhookReconciler};

/// A fully wired subscription service.
///
/// Owns the orchestrator, the webhook reconciler and (on demand) the
/// scheduled transition runner, all sharing one store.
pub struct Tollway<S: SubscriptionStore> {
    config: Config,
    orchestrator: Arc<SubscriptionOrchestrator<S>>,
    reconciler: Arc<WebhookReconciler<S>>,
}

impl<S: SubscriptionStore> Tollway<S> {
    /// Build adapters, the provisioning client and the orchestrator from `config`.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid, an adapter cannot be built
    /// from its credentials, or no provisioning endpoint is configured.
    pub fn from_config(config: Config, store: Arc<S>, abuse_gate: Arc<dyn AbuseGate>) -> Result<Self> {
        config.validate()?;

        let registry = build_registry(&config).map_err(|e| {
            TollwayError::bad_request(format!("Gateway configuration rejected: {}", e))
        })?;

        let provisioning = config
            .provisioning
            .clone()
            .ok_or_else(|| TollwayError::bad_request("Provisioning URL is not configured"))?;
        let client = HttpProvisioningClient::new(provisioning).map_err(|e| {
            TollwayError::bad_request(format!("Provisioning configuration rejected: {}", e))
        })?;
        let provisioner = Provisioner::new(Arc::new(client), RetryExecutor::new(config.retry.policy()));

        let orchestrator = SubscriptionOrchestrator::new(store, registry, provisioner)
            .with_abuse_gate(abuse_gate)
            .with_audit_sink(Arc::new(TracingAuditSink))
            .with_settings(OrchestratorSettings {
                free_package_name: config.free_tier.package_name.clone(),
                abuse_prevention: config.free_tier.abuse_prevention,
            });

        Ok(Self::from_parts(config, Arc::new(orchestrator)))
    }

    /// Wrap an orchestrator assembled by hand, e.g. with test doubles.
    pub fn from_parts(config: Config, orchestrator: Arc<SubscriptionOrchestrator<S>>) -> Self {
        let reconciler = Arc::new(WebhookReconciler::new(orchestrator.clone()));
        Self {
            config,
            orchestrator,
            reconciler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<SubscriptionOrchestrator<S>> {
        &self.orchestrator
    }

    pub fn reconciler(&self) -> &Arc<WebhookReconciler<S>> {
        &self.reconciler
    }

    /// Router carrying the webhook endpoint.
    pub fn router(&self) -> Router {
        webhook_router(self.reconciler.clone())
    }

    /// Start the periodic sweep, unless disabled in configuration.
    pub fn spawn_scheduler(&self) -> Option<RunnerHandle> {
        if !self.config.scheduler.enabled {
            tracing::info!(target: "tollway::scheduler", "Scheduled transition runner disabled");
            return None;
        }
        let runner = ScheduledTransitionRunner::new(self.orchestrator.clone());
        Some(runner.spawn(self.config.scheduler.interval()))
    }

    /// Serve the webhook endpoint until Ctrl+C or SIGTERM, then stop the
    /// scheduler after in-flight requests drain.
    pub async fn serve(self) -> std::result::Result<(), std::io::Error> {
        let addr = self
            .config
            .server
            .addr()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let scheduler = self.spawn_scheduler();

        tracing::info!(
            addr = %addr,
            gateways = ?self.orchestrator.gateways().kinds(),
            "Tollway listening"
        );

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await;

        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        served
    }
}

fn build_registry(config: &Config) -> std::result::Result<GatewayRegistry, GatewayError> {
    let gateways = &config.gateways;
    let timeout = gateways.timeout();
    let mut registry = GatewayRegistry::new(gateways.product_bindings.clone());

    if let Some(fastspring) = &gateways.fastspring {
        let adapter = FastSpringAdapter::new(fastspring.clone().with_timeout(timeout))?;
        registry.register(Arc::new(adapter));
    }
    if let Some(paddle) = &gateways.paddle {
        let adapter = PaddleAdapter::new(paddle.clone().with_timeout(timeout))?;
        registry.register(Arc::new(adapter));
    }
    if let Some(payproglobal) = &gateways.payproglobal {
        let adapter = PayProGlobalAdapter::new(payproglobal.clone().with_timeout(timeout))?;
        registry.register(Arc::new(adapter));
    }
    if let Some(default) = gateways.default_gateway {
        registry = registry.with_default_gateway(default);
    }

    if registry.kinds().is_empty() {
        tracing::warn!(target: "tollway::gateway", "No payment gateway configured");
    }
    Ok(registry)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, starting graceful shutdown");
        },
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::gateway::{GatewayKind, PayProGlobalConfig};
    use crate::orchestrator::AllowAllGate;
    use crate::provisioning::HttpProvisioningConfig;
    use crate::store::InMemorySubscriptionStore;

    #[test]
    fn test_from_config_requires_provisioning() {
        let config = ConfigBuilder::new().build().unwrap();
        let result = Tollway::from_config(
            config,
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(AllowAllGate),
        );
        assert!(matches!(result, Err(TollwayError::BadRequest(_))));
    }

    #[test]
    fn test_from_config_registers_configured_gateways() {
        let config = ConfigBuilder::new()
            .with_payproglobal(PayProGlobalConfig::new("vendor", "secret", "webhook"))
            .with_provisioning(HttpProvisioningConfig::new("http://localhost:9", "key"))
            .with_scheduler(false, 60)
            .build()
            .unwrap();
        let app = Tollway::from_config(
            config,
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(AllowAllGate),
        )
        .unwrap();

        assert_eq!(app.orchestrator().gateways().kinds(), vec![GatewayKind::PayProGlobal]);
        assert_eq!(
            app.orchestrator().gateways().default_gateway(),
            Some(GatewayKind::PayProGlobal)
        );
        assert!(app.spawn_scheduler().is_none());
    }

    #[test]
    fn test_from_config_rejects_unusable_provisioning_url() {
        let config = ConfigBuilder::new()
            .with_provisioning(HttpProvisioningConfig::new("provisioning.local", "key"))
            .with_scheduler(false, 60)
            .build()
            .unwrap();
        let result = Tollway::from_config(
            config,
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(AllowAllGate),
        );
        let Err(TollwayError::BadRequest(message)) = result else {
            panic!("expected a configuration error");
        };
        assert!(message.contains("Provisioning configuration rejected"));
    }
}
