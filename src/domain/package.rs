use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Name of the built-in zero-price package.
pub const FREE_PACKAGE_NAME: &str = "Free";

/// A purchasable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    /// ISO 4217 code, passed through to the gateway untouched.
    pub currency: String,
    /// Billing period length. `None` for non-expiring packages.
    pub duration_days: Option<u32>,
    /// Product code used when fetching license codes from the provisioning API.
    pub license_sku: Option<String>,
}

impl Package {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Decimal) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            currency: "USD".to_string(),
            duration_days: Some(30),
            license_sku: None,
        }
    }

    /// Zero-price package that never expires.
    pub fn free(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.to_lowercase(),
            name,
            price: Decimal::ZERO,
            currency: "USD".to_string(),
            duration_days: None,
            license_sku: None,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_duration_days(mut self, days: Option<u32>) -> Self {
        self.duration_days = days;
        self
    }

    pub fn with_license_sku(mut self, sku: impl Into<String>) -> Self {
        self.license_sku = Some(sku.into());
        self
    }

    /// True for zero-price packages and for anything named like the free tier.
    pub fn is_free(&self) -> bool {
        self.price.is_zero() || self.is_named_free()
    }

    pub fn is_named_free(&self) -> bool {
        self.name.eq_ignore_ascii_case(FREE_PACKAGE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_free_detection() {
        assert!(Package::free("Free").is_free());
        assert!(Package::new("promo", "free", Decimal::new(500, 2)).is_free());
        assert!(Package::new("zero", "Zero", Decimal::ZERO).is_free());
        assert!(!Package::new("starter", "Starter", Decimal::new(999, 2)).is_free());
    }

    #[test]
    fn test_free_package_never_expires() {
        let free = Package::free("Free");
        assert_eq!(free.id, "free");
        assert_eq!(free.duration_days, None);
    }
}
