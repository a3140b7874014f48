//! Lifecycle error taxonomy.
//!
//! Every failure the orchestrator surfaces falls into one [`ErrorCategory`];
//! the category alone decides whether it is retried and what the end user
//! is shown.

use crate::domain::LedgerError;
use crate::error::TollwayError;
use crate::gateway::{GatewayError, GatewayKind};
use crate::provisioning::ProvisioningError;
use crate::retry::RetryError;

use super::free_tier::FreeTierSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid request; surfaced immediately, never retried.
    Validation,
    /// A remote system explicitly refused; surfaced with a readable reason.
    TerminalExternal,
    /// Network, timeout or 5xx after the retry budget was spent.
    TransientExternal,
    /// Webhook problems; logged as security events, never shown to users.
    ReconciliationAnomaly,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    // Validation
    #[error("package '{package_id}' not found")]
    PackageNotFound { package_id: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("this is not an upgrade: '{target}' is not priced above '{current}'")]
    NotAnUpgrade { current: String, target: String },

    #[error("this is not a downgrade: '{target}' is not priced below '{current}'")]
    NotADowngrade { current: String, target: String },

    #[error("user '{user_id}' has no active package")]
    NoActivePackage { user_id: String },

    #[error("no subscription id on record for user '{user_id}'")]
    MissingSubscriptionId { user_id: String },

    #[error("no payment gateway on record for user '{user_id}'")]
    MissingGateway { user_id: String },

    #[error("payment gateway '{gateway}' is not configured")]
    GatewayNotConfigured { gateway: GatewayKind },

    #[error("package '{package_id}' has no product on gateway '{gateway}'")]
    ProductNotBound { package_id: String, gateway: GatewayKind },

    #[error("user '{user_id}' has already used the free tier ({signal})")]
    FreeTierAlreadyUsed { user_id: String, signal: FreeTierSignal },

    #[error("free tier not available: {reason}")]
    FreeTierBlocked { user_id: String, reason: String },

    #[error("the subscription of user '{user_id}' is already set to end")]
    CancellationPending { user_id: String },

    // Terminal external
    #[error("gateway '{gateway}' rejected {operation}: {message}")]
    GatewayRejected {
        gateway: GatewayKind,
        operation: &'static str,
        message: String,
    },

    #[error("gateway '{gateway}' did not apply {operation}")]
    GatewayChangeFailed {
        gateway: GatewayKind,
        operation: &'static str,
    },

    #[error("provisioning {operation} rejected: {message}")]
    ProvisioningRejected {
        operation: &'static str,
        message: String,
        user_message: Option<String>,
    },

    // Transient external
    #[error("gateway '{gateway}' unavailable during {operation}: {message}")]
    GatewayUnavailable {
        gateway: GatewayKind,
        operation: &'static str,
        message: String,
    },

    #[error("provisioning {operation} unavailable after {attempts} attempts: {message}")]
    ProvisioningUnavailable {
        operation: &'static str,
        message: String,
        attempts: u32,
    },

    // Reconciliation anomalies
    #[error("invalid webhook signature from '{gateway}'")]
    InvalidWebhookSignature { gateway: GatewayKind },

    #[error("invalid webhook payload from '{gateway}': {message}")]
    InvalidWebhookPayload { gateway: GatewayKind, message: String },

    #[error("unknown gateway '{name}'")]
    UnknownGateway { name: String },

    // Internal
    #[error("conflicting update: {message}")]
    Conflict { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl LifecycleError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PackageNotFound { .. }
            | Self::NotFound { .. }
            | Self::NotAnUpgrade { .. }
            | Self::NotADowngrade { .. }
            | Self::NoActivePackage { .. }
            | Self::MissingSubscriptionId { .. }
            | Self::MissingGateway { .. }
            | Self::GatewayNotConfigured { .. }
            | Self::ProductNotBound { .. }
            | Self::FreeTierAlreadyUsed { .. }
            | Self::FreeTierBlocked { .. }
            | Self::CancellationPending { .. } => ErrorCategory::Validation,

            Self::GatewayRejected { .. }
            | Self::GatewayChangeFailed { .. }
            | Self::ProvisioningRejected { .. } => ErrorCategory::TerminalExternal,

            Self::GatewayUnavailable { .. } | Self::ProvisioningUnavailable { .. } => {
                ErrorCategory::TransientExternal
            }

            Self::InvalidWebhookSignature { .. }
            | Self::InvalidWebhookPayload { .. }
            | Self::UnknownGateway { .. } => ErrorCategory::ReconciliationAnomaly,

            Self::Conflict { .. } | Self::Storage { .. } => ErrorCategory::Internal,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::TransientExternal
    }

    /// Message safe to show the end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::Validation => self.to_string(),
            ErrorCategory::TerminalExternal => match self {
                Self::ProvisioningRejected {
                    user_message: Some(message),
                    ..
                } => message.clone(),
                Self::ProvisioningRejected { .. } => {
                    "Your account could not be set up. Please contact support.".to_string()
                }
                _ => "The payment provider could not complete this change.".to_string(),
            },
            ErrorCategory::TransientExternal => {
                "The service is temporarily unavailable. Please try again later.".to_string()
            }
            ErrorCategory::ReconciliationAnomaly => "Request rejected.".to_string(),
            ErrorCategory::Internal => "Something went wrong. Please try again.".to_string(),
        }
    }

    /// Classify a gateway failure for `gateway`.
    pub fn from_gateway(gateway: GatewayKind, err: GatewayError) -> Self {
        let transient = err.is_transient();
        match err {
            GatewayError::UnknownGateway(name) => Self::UnknownGateway { name },
            GatewayError::InvalidPayload(message) => Self::InvalidWebhookPayload { gateway, message },
            GatewayError::Configuration(message) => Self::Storage { message },
            GatewayError::Rejected { operation, message, .. }
            | GatewayError::InvalidResponse { operation, message }
            | GatewayError::Transport { operation, message } => {
                if transient {
                    Self::GatewayUnavailable {
                        gateway,
                        operation,
                        message,
                    }
                } else {
                    Self::GatewayRejected {
                        gateway,
                        operation,
                        message,
                    }
                }
            }
        }
    }
}

impl From<RetryError<ProvisioningError>> for LifecycleError {
    fn from(err: RetryError<ProvisioningError>) -> Self {
        let attempts = err.attempts();
        match err {
            RetryError::Terminal { error, .. } => Self::ProvisioningRejected {
                operation: error.operation,
                message: error.message,
                user_message: error.user_message,
            },
            RetryError::Exhausted { error, .. } => Self::ProvisioningUnavailable {
                operation: error.operation,
                message: error.message,
                attempts,
            },
        }
    }
}

impl From<LedgerError> for LifecycleError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::OrderNotFound(id) => Self::NotFound {
                what: format!("order {}", id),
            },
            other => Self::Conflict {
                message: other.to_string(),
            },
        }
    }
}

impl From<TollwayError> for LifecycleError {
    fn from(err: TollwayError) -> Self {
        match err {
            TollwayError::NotFound(what) => Self::NotFound { what },
            TollwayError::Conflict(message) => Self::Conflict { message },
            other => Self::Storage {
                message: other.to_string(),
            },
        }
    }
}

impl From<LifecycleError> for TollwayError {
    fn from(err: LifecycleError) -> Self {
        match err.category() {
            ErrorCategory::Validation => match err {
                LifecycleError::PackageNotFound { .. } | LifecycleError::NotFound { .. } => {
                    TollwayError::NotFound(err.to_string())
                }
                _ => TollwayError::BadRequest(err.to_string()),
            },
            ErrorCategory::TerminalExternal => TollwayError::BadRequest(err.user_message()),
            ErrorCategory::TransientExternal => TollwayError::ServiceUnavailable(err.to_string()),
            ErrorCategory::ReconciliationAnomaly => match err {
                LifecycleError::InvalidWebhookSignature { .. } => {
                    TollwayError::Unauthorized("invalid webhook signature".to_string())
                }
                LifecycleError::UnknownGateway { .. } => TollwayError::NotFound(err.to_string()),
                _ => TollwayError::BadRequest(err.to_string()),
            },
            ErrorCategory::Internal => match err {
                LifecycleError::Conflict { message } => TollwayError::Conflict(message),
                other => TollwayError::Internal(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = LifecycleError::NotAnUpgrade {
            current: "pro".into(),
            target: "starter".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_retryable());
        assert!(err.user_message().contains("not an upgrade"));

        let err = LifecycleError::ProvisioningUnavailable {
            operation: "create_tenant",
            message: "HTTP 503".into(),
            attempts: 3,
        };
        assert_eq!(err.category(), ErrorCategory::TransientExternal);
        assert!(err.is_retryable());
        assert!(err.user_message().contains("try again later"));
    }

    #[test]
    fn test_terminal_provisioning_shows_remote_reason() {
        let retry_err = RetryError::Terminal {
            error: ProvisioningError::terminal(
                "bind_credential",
                "HTTP 409",
                "This email is already registered elsewhere",
            ),
            attempts: 1,
        };
        let err = LifecycleError::from(retry_err);
        assert_eq!(err.category(), ErrorCategory::TerminalExternal);
        assert_eq!(err.user_message(), "This email is already registered elsewhere");
    }

    #[test]
    fn test_gateway_error_classification() {
        let transient = LifecycleError::from_gateway(
            GatewayKind::Paddle,
            GatewayError::Rejected {
                operation: "create_checkout",
                status: 503,
                message: String::new(),
            },
        );
        assert!(matches!(transient, LifecycleError::GatewayUnavailable { .. }));

        let rejected = LifecycleError::from_gateway(
            GatewayKind::Paddle,
            GatewayError::Rejected {
                operation: "create_checkout",
                status: 422,
                message: "bad price".into(),
            },
        );
        assert_eq!(rejected.category(), ErrorCategory::TerminalExternal);
    }

    #[test]
    fn test_http_mapping() {
        let err: TollwayError = LifecycleError::InvalidWebhookSignature {
            gateway: GatewayKind::FastSpring,
        }
        .into();
        assert!(matches!(err, TollwayError::Unauthorized(_)));

        let err: TollwayError = LifecycleError::PackageNotFound {
            package_id: "gold".into(),
        }
        .into();
        assert!(matches!(err, TollwayError::NotFound(_)));

        let err: TollwayError = LifecycleError::GatewayUnavailable {
            gateway: GatewayKind::Paddle,
            operation: "upgrade",
            message: "timeout".into(),
        }
        .into();
        assert!(matches!(err, TollwayError::ServiceUnavailable(_)));
    }
}
