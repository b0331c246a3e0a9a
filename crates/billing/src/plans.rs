//! Plan catalogue and sandbox identities
//!
//! Amounts, tier breakpoints and test identities are fixed values. Stripe is
//! the only validator of these; nothing is checked locally.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use stripe::{CreatePriceRecurringInterval, Currency, PriceTiersMode, UpTo, UpToOther};

use crate::error::{BillingError, BillingResult};
use crate::models::{
    AggregationFormula, CustomerMappingType, MeterAggregation, MeterCustomerMapping,
    MeterValueSettings,
};

/// Stripe's built-in Visa test token, auto-approved in sandbox mode
pub const TEST_CARD_TOKEN: &str = "pm_card_visa";

/// Usage reported by the metered workflow (GB streamed this cycle)
pub const DEFAULT_USAGE_VALUE: &str = "150";

/// Subscription expansion that inlines the first charge attempt
pub const EXPAND_LATEST_PAYMENT: &str = "latest_invoice.payment_intent";

/// A band of a graduated tier table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTier {
    pub up_to: UpTo,
    /// Per-unit amount in cents, as a decimal string
    pub unit_amount_decimal: String,
}

impl PriceTier {
    pub fn new(up_to: UpTo, unit_amount_decimal: &str) -> Self {
        Self {
            up_to,
            unit_amount_decimal: unit_amount_decimal.to_string(),
        }
    }
}

/// Open-ended upper bound of the last tier
pub const UNBOUNDED: UpTo = UpTo::Other(UpToOther::Inf);

/// Single flat monthly price
#[derive(Debug, Clone)]
pub struct FlatPlan {
    pub product_name: String,
    pub product_description: String,
    pub currency: Currency,
    pub unit_amount_cents: i64,
    pub interval: CreatePriceRecurringInterval,
}

impl FlatPlan {
    /// Plan A: $24.99/month unlimited streaming
    pub fn streaming_unlimited() -> Self {
        Self {
            product_name: "Streaming Unlimited Plan A".to_string(),
            product_description: "Unlimited monthly access to streaming service".to_string(),
            currency: Currency::USD,
            unit_amount_cents: 2499,
            interval: CreatePriceRecurringInterval::Month,
        }
    }
}

/// Usage meter definition
#[derive(Debug, Clone)]
pub struct MeterDefinition {
    pub display_name: String,
    /// Must be unique per Stripe account
    pub event_name: String,
    pub formula: AggregationFormula,
    pub customer_payload_key: String,
    pub value_payload_key: String,
}

impl MeterDefinition {
    pub fn aggregation(&self) -> MeterAggregation {
        MeterAggregation {
            formula: self.formula,
        }
    }

    pub fn customer_mapping(&self) -> MeterCustomerMapping {
        MeterCustomerMapping {
            event_payload_key: self.customer_payload_key.clone(),
            mapping_type: CustomerMappingType::ById,
        }
    }

    pub fn value_settings(&self) -> MeterValueSettings {
        MeterValueSettings {
            event_payload_key: self.value_payload_key.clone(),
        }
    }
}

/// Licensed base price plus a metered overage price on a tier table
#[derive(Debug, Clone)]
pub struct MeteredPlan {
    pub product_name: String,
    pub product_description: String,
    pub currency: Currency,
    pub interval: CreatePriceRecurringInterval,
    pub base_amount_cents: i64,
    pub meter: MeterDefinition,
    pub tiers_mode: PriceTiersMode,
    pub tiers: Vec<PriceTier>,
    pub overage_nickname: String,
}

impl MeteredPlan {
    /// Plan B: $10.99/month covering 100 GB, then $1.00 per 10 GB
    /// (10 cents per GB on the second tier)
    pub fn streaming_per_gb() -> Self {
        Self {
            product_name: "Streaming GB Metered Plan B".to_string(),
            product_description: "Metered plan: $10.99 for 100GB, then $1.00 per 10GB"
                .to_string(),
            currency: Currency::USD,
            interval: CreatePriceRecurringInterval::Month,
            base_amount_cents: 1099,
            meter: MeterDefinition {
                display_name: "Streaming GB Usage".to_string(),
                event_name: "streaming_per_gb".to_string(),
                formula: AggregationFormula::Sum,
                customer_payload_key: "stripe_customer_id".to_string(),
                value_payload_key: "value".to_string(),
            },
            tiers_mode: PriceTiersMode::Graduated,
            tiers: vec![
                PriceTier::new(UpTo::Max(100), "0"),
                PriceTier::new(UNBOUNDED, "10"),
            ],
            overage_nickname: "GB Overage Meter".to_string(),
        }
    }

    /// Overage in cents for a cycle's aggregated usage, graduated over the
    /// tier table and rounded to whole cents. Mirrors what Stripe computes for
    /// the invoice; used for the run report only.
    ///
    /// Fails on a tier rate that is not a decimal number.
    pub fn estimated_overage_cents(&self, usage: u64) -> BillingResult<u64> {
        let mut remaining = usage;
        let mut floor = 0u64;
        let mut total = Decimal::ZERO;

        for tier in &self.tiers {
            if remaining == 0 {
                break;
            }
            let band = match tier.up_to {
                UpTo::Max(limit) => limit.saturating_sub(floor).min(remaining),
                UpTo::Other(UpToOther::Inf) => remaining,
            };
            let rate: Decimal = tier.unit_amount_decimal.parse().map_err(|e| {
                BillingError::Config(format!(
                    "Invalid tier rate '{}': {}",
                    tier.unit_amount_decimal, e
                ))
            })?;
            total = Decimal::from(band)
                .checked_mul(rate)
                .and_then(|amount| total.checked_add(amount))
                .ok_or_else(|| BillingError::Internal("Overage estimate overflowed".to_string()))?;
            remaining -= band;
            if let UpTo::Max(limit) = tier.up_to {
                floor = limit;
            }
        }

        total
            .round()
            .to_u64()
            .ok_or_else(|| BillingError::Config(format!("Negative overage estimate: {}", total)))
    }
}

/// Sandbox customer identity
#[derive(Debug, Clone)]
pub struct CustomerProfile {
    pub email: String,
    pub name: String,
    pub payment_token: String,
}

impl CustomerProfile {
    pub fn test_user_a() -> Self {
        Self {
            email: "testuserA@steamingexample.com".to_string(),
            name: "Test User A".to_string(),
            payment_token: TEST_CARD_TOKEN.to_string(),
        }
    }

    pub fn test_user_b() -> Self {
        Self {
            email: "testuserB@example.com".to_string(),
            name: "Test User B".to_string(),
            payment_token: TEST_CARD_TOKEN.to_string(),
        }
    }
}
