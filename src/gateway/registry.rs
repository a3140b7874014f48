use std::collections::HashMap;
use std::sync::Arc;

use super::{GatewayAdapter, GatewayError, GatewayKind};

/// Read-only map from (package, gateway) to the gateway's product or price id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductBindings {
    bindings: HashMap<(String, GatewayKind), String>,
}

impl ProductBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(
        mut self,
        package_id: impl Into<String>,
        gateway: GatewayKind,
        product_id: impl Into<String>,
    ) -> Self {
        self.bindings.insert((package_id.into(), gateway), product_id.into());
        self
    }

    pub fn product_for(&self, package_id: &str, gateway: GatewayKind) -> Option<&str> {
        self.bindings
            .get(&(package_id.to_string(), gateway))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Parse `package:gateway:product` entries separated by commas.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let mut bindings = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(package), Some(gateway), Some(product))
                    if !package.is_empty() && !product.is_empty() =>
                {
                    bindings = bindings.bind(package, gateway.parse()?, product);
                }
                _ => {
                    return Err(GatewayError::Configuration(format!(
                        "invalid product binding '{}', expected package:gateway:product",
                        entry
                    )))
                }
            }
        }
        Ok(bindings)
    }
}

/// Adapters keyed by gateway, plus the product binding table.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    adapters: HashMap<GatewayKind, Arc<dyn GatewayAdapter>>,
    bindings: ProductBindings,
    default_gateway: Option<GatewayKind>,
}

impl GatewayRegistry {
    pub fn new(bindings: ProductBindings) -> Self {
        Self {
            adapters: HashMap::new(),
            bindings,
            default_gateway: None,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn with_default_gateway(mut self, gateway: GatewayKind) -> Self {
        self.default_gateway = Some(gateway);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn GatewayAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: GatewayKind) -> Option<Arc<dyn GatewayAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn bindings(&self) -> &ProductBindings {
        &self.bindings
    }

    /// Gateway used for new checkouts when the caller does not pick one.
    pub fn default_gateway(&self) -> Option<GatewayKind> {
        self.default_gateway
            .or_else(|| (self.adapters.len() == 1).then(|| self.adapters.keys().next().copied()).flatten())
    }

    pub fn kinds(&self) -> Vec<GatewayKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("adapters", &self.kinds())
            .field("bindings", &self.bindings.len())
            .field("default_gateway", &self.default_gateway)
            .finish()
    }
}
