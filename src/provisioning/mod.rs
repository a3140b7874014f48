//! External tenant and license provisioning.
//!
//! [`ProvisioningClient`] is the seam; [`HttpProvisioningClient`] talks to the
//! real API with subscription-key auth and a bounded request timeout.

mod client;
mod http;

pub use client::{LicenseCode, ProvisioningClient, ProvisioningError, Tenant, TenantRequest};
pub use http::{HttpProvisioningClient, HttpProvisioningConfig};
