//! Billing Invariants Module
//!
//! Local consistency checks between the objects a provisioning run creates.
//! A metered subscription bills nothing if its meter events do not line up
//! with the meter: Stripe accepts such events and silently never aggregates
//! them. These checks catch that before the event is sent.
//!
//! ## Design Principles
//!
//! 1. **Offline**: checks read the objects already in hand, no platform calls
//! 2. **Explanatory**: violations include enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use stripe::{CustomerId, Price, RecurringUsageType, Subscription};

use crate::catalog::MeteredCatalog;
use crate::models::{CreateMeterEventParams, Meter, MeteredPrice};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - usage will not be billed or the wrong thing will be
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    #[serde(with = "time::serde::timestamp")]
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn has_critical(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Critical)
    }
}

/// Runs invariant checks over provisioned objects
#[derive(Debug, Default)]
pub struct InvariantChecker;

impl InvariantChecker {
    pub fn new() -> Self {
        Self
    }

    /// Run every check relevant to a metered plan
    pub fn check_metered_plan(
        &self,
        catalog: &MeteredCatalog,
        customer_id: &CustomerId,
        subscription: Option<&Subscription>,
        event: Option<&CreateMeterEventParams>,
    ) -> InvariantCheckSummary {
        let mut results =
            vec![self.metered_price_bound_to_meter(&catalog.overage_price, &catalog.meter)];

        if let Some(sub) = subscription {
            results.push(self.subscription_references_prices(
                sub,
                customer_id,
                &[&catalog.base_price, &catalog.overage_price.price],
            ));
        }
        if let Some(event) = event {
            results.push(self.meter_event_matches_meter(event, &catalog.meter, customer_id));
        }

        summarize(results)
    }

    /// Run the checks relevant to a flat plan
    pub fn check_flat_plan(
        &self,
        price: &Price,
        customer_id: &CustomerId,
        subscription: &Subscription,
    ) -> InvariantCheckSummary {
        summarize(vec![self.subscription_references_prices(
            subscription,
            customer_id,
            &[price],
        )])
    }

    /// The event must use the meter's event name, and its payload keys must be
    /// exactly the meter's value key and customer mapping key, with the
    /// customer key holding this customer's id. A meter that reads both from
    /// the same key can never receive a usable event.
    pub fn meter_event_matches_meter(
        &self,
        event: &CreateMeterEventParams,
        meter: &Meter,
        customer_id: &str,
    ) -> Option<InvariantViolation> {
        let customer_key = &meter.customer_mapping.event_payload_key;
        let value_key = &meter.value_settings.event_payload_key;

        let expected: BTreeSet<&str> = [customer_key.as_str(), value_key.as_str()].into();
        let actual: BTreeSet<&str> = event.payload.keys().map(String::as_str).collect();

        let mut problems = Vec::new();
        if customer_key == value_key {
            problems.push(format!(
                "meter uses '{}' for both the customer and the value",
                customer_key
            ));
        }
        if event.event_name != meter.event_name {
            problems.push(format!(
                "event_name '{}' does not match meter event_name '{}'",
                event.event_name, meter.event_name
            ));
        }
        if actual != expected {
            problems.push(format!(
                "payload keys {:?} differ from meter keys {:?}",
                actual, expected
            ));
        }
        if event.payload.get(customer_key).map(String::as_str) != Some(customer_id) {
            problems.push(format!(
                "payload '{}' does not carry customer {}",
                customer_key, customer_id
            ));
        }

        if problems.is_empty() {
            return None;
        }

        Some(InvariantViolation {
            invariant: "meter_event_matches_meter".to_string(),
            description: problems.join("; "),
            context: serde_json::json!({
                "meter_id": meter.id,
                "meter_event_name": meter.event_name,
                "event_name": event.event_name,
                "payload_keys": actual,
            }),
            severity: ViolationSeverity::Critical,
        })
    }

    /// A metered price must reference the meter that aggregates its usage
    pub fn metered_price_bound_to_meter(
        &self,
        overage: &MeteredPrice,
        meter: &Meter,
    ) -> Option<InvariantViolation> {
        let price = &overage.price;
        let usage_type = price.recurring.as_ref().map(|r| r.usage_type);
        let bound_meter = overage.meter.as_deref();

        if usage_type == Some(RecurringUsageType::Metered) && bound_meter == Some(meter.id.as_str())
        {
            return None;
        }

        Some(InvariantViolation {
            invariant: "metered_price_bound_to_meter".to_string(),
            description: format!(
                "Price {} is not a metered price bound to meter {}",
                price.id, meter.id
            ),
            context: serde_json::json!({
                "price_id": price.id,
                "usage_type": usage_type,
                "recurring_meter": bound_meter,
                "meter_id": meter.id,
            }),
            severity: ViolationSeverity::Critical,
        })
    }

    /// The subscription belongs to the customer and its items reference
    /// exactly the given prices
    pub fn subscription_references_prices(
        &self,
        subscription: &Subscription,
        customer_id: &CustomerId,
        prices: &[&Price],
    ) -> Option<InvariantViolation> {
        let expected: BTreeSet<&str> = prices.iter().map(|p| p.id.as_str()).collect();
        let actual: BTreeSet<&str> = subscription
            .items
            .data
            .iter()
            .filter_map(|item| item.price.as_ref().map(|p| p.id.as_str()))
            .collect();
        let item_count = subscription.items.data.len();
        let subscription_customer = subscription.customer.id();

        if subscription_customer == *customer_id
            && actual == expected
            && item_count == prices.len()
        {
            return None;
        }

        Some(InvariantViolation {
            invariant: "subscription_references_prices".to_string(),
            description: format!(
                "Subscription {} does not bind customer {} to the catalog prices",
                subscription.id, customer_id
            ),
            context: serde_json::json!({
                "subscription_customer": subscription_customer,
                "customer_id": customer_id,
                "expected_prices": expected,
                "actual_prices": actual,
                "item_count": item_count,
            }),
            severity: ViolationSeverity::High,
        })
    }
}

fn summarize(results: Vec<Option<InvariantViolation>>) -> InvariantCheckSummary {
    let checks_run = results.len();
    let violations: Vec<InvariantViolation> = results.into_iter().flatten().collect();
    let checks_failed = violations.len();

    for violation in &violations {
        tracing::warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            description = %violation.description,
            "Billing invariant violated"
        );
    }

    InvariantCheckSummary {
        checked_at: OffsetDateTime::now_utc(),
        checks_run,
        checks_passed: checks_run - checks_failed,
        checks_failed,
        healthy: violations.is_empty(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripe::{
        Expandable, List, PriceId, Recurring, RecurringInterval, SubscriptionItem,
        SubscriptionStatus,
    };

    use crate::metered::meter_event_params;
    use crate::models::{
        AggregationFormula, CustomerMappingType, MeterAggregation, MeterCustomerMapping,
        MeterValueSettings,
    };

    fn meter() -> Meter {
        Meter {
            id: "mtr_1".to_string(),
            display_name: "Streaming GB Usage".to_string(),
            event_name: "streaming_per_gb".to_string(),
            default_aggregation: MeterAggregation {
                formula: AggregationFormula::Sum,
            },
            customer_mapping: MeterCustomerMapping {
                event_payload_key: "stripe_customer_id".to_string(),
                mapping_type: CustomerMappingType::ById,
            },
            value_settings: MeterValueSettings {
                event_payload_key: "value".to_string(),
            },
            status: None,
        }
    }

    fn customer(raw: &str) -> CustomerId {
        raw.parse().unwrap()
    }

    fn price(id: &str, usage_type: RecurringUsageType) -> Price {
        Price {
            id: id.parse::<PriceId>().unwrap(),
            recurring: Some(Recurring {
                interval: RecurringInterval::Month,
                interval_count: 1,
                usage_type,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn metered(id: &str, usage_type: RecurringUsageType, meter: Option<&str>) -> MeteredPrice {
        MeteredPrice {
            price: price(id, usage_type),
            meter: meter.map(str::to_string),
        }
    }

    fn subscription(customer_id: &str, prices: &[&Price]) -> Subscription {
        Subscription {
            id: "sub_1".parse().unwrap(),
            customer: Expandable::Id(customer(customer_id)),
            status: SubscriptionStatus::Active,
            items: List {
                data: prices
                    .iter()
                    .map(|p| SubscriptionItem {
                        id: format!("si_{}", p.id).parse().unwrap(),
                        price: Some((*p).clone()),
                        ..Default::default()
                    })
                    .collect(),
                has_more: false,
                total_count: None,
                url: "/v1/subscription_items".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_event_built_from_meter_passes() {
        let checker = InvariantChecker::new();
        let event = meter_event_params(&meter(), "cus_1", "150");
        assert!(checker
            .meter_event_matches_meter(&event, &meter(), "cus_1")
            .is_none());
    }

    #[test]
    fn test_wrong_customer_key_is_critical() {
        let checker = InvariantChecker::new();
        let mut event = meter_event_params(&meter(), "cus_1", "150");
        let id = event.payload.remove("stripe_customer_id").unwrap();
        event.payload.insert("customer".to_string(), id);

        let violation = checker
            .meter_event_matches_meter(&event, &meter(), "cus_1")
            .unwrap();
        assert_eq!(violation.severity, ViolationSeverity::Critical);
        assert!(violation.description.contains("payload keys"));
    }

    #[test]
    fn test_wrong_event_name_detected() {
        let checker = InvariantChecker::new();
        let mut event = meter_event_params(&meter(), "cus_1", "150");
        event.event_name = "streaming_gb".to_string();

        let violation = checker
            .meter_event_matches_meter(&event, &meter(), "cus_1")
            .unwrap();
        assert!(violation.description.contains("event_name"));
    }

    #[test]
    fn test_extra_payload_key_detected() {
        let checker = InvariantChecker::new();
        let mut event = meter_event_params(&meter(), "cus_1", "150");
        event
            .payload
            .insert("quality".to_string(), "hd".to_string());

        assert!(checker
            .meter_event_matches_meter(&event, &meter(), "cus_1")
            .is_some());
    }

    #[test]
    fn test_meter_reading_customer_and_value_from_one_key() {
        let checker = InvariantChecker::new();
        let mut shared = meter();
        shared.value_settings.event_payload_key = "stripe_customer_id".to_string();

        // the customer id overwrites the value under the shared key
        let event = meter_event_params(&shared, "cus_1", "150");
        assert_eq!(event.payload.len(), 1);

        let violation = checker
            .meter_event_matches_meter(&event, &shared, "cus_1")
            .unwrap();
        assert_eq!(violation.severity, ViolationSeverity::Critical);
        assert!(violation.description.contains("both the customer and the value"));
    }

    #[test]
    fn test_metered_price_binding() {
        let checker = InvariantChecker::new();
        let bound = metered("price_o", RecurringUsageType::Metered, Some("mtr_1"));
        let unbound = metered("price_o", RecurringUsageType::Metered, Some("mtr_other"));
        let unechoed = metered("price_o", RecurringUsageType::Metered, None);
        let licensed = metered("price_b", RecurringUsageType::Licensed, Some("mtr_1"));

        assert!(checker.metered_price_bound_to_meter(&bound, &meter()).is_none());
        assert!(checker.metered_price_bound_to_meter(&unbound, &meter()).is_some());
        assert!(checker.metered_price_bound_to_meter(&unechoed, &meter()).is_some());
        assert!(checker.metered_price_bound_to_meter(&licensed, &meter()).is_some());
    }

    #[test]
    fn test_subscription_price_mismatch() {
        let checker = InvariantChecker::new();
        let base = price("price_b", RecurringUsageType::Licensed);
        let overage = price("price_o", RecurringUsageType::Metered);

        let sub = subscription("cus_1", &[&base]);
        let violation = checker
            .subscription_references_prices(&sub, &customer("cus_1"), &[&base, &overage])
            .unwrap();
        assert_eq!(violation.severity, ViolationSeverity::High);

        let other_customer = subscription("cus_2", &[&base, &overage]);
        assert!(checker
            .subscription_references_prices(&other_customer, &customer("cus_1"), &[&base, &overage])
            .is_some());

        let ok = subscription("cus_1", &[&base, &overage]);
        assert!(checker
            .subscription_references_prices(&ok, &customer("cus_1"), &[&base, &overage])
            .is_none());
    }

    #[test]
    fn test_summary_counts() {
        let checker = InvariantChecker::new();
        let base = price("price_b", RecurringUsageType::Licensed);
        let sub = subscription("cus_2", &[&base]);

        let summary = checker.check_flat_plan(&base, &customer("cus_1"), &sub);
        assert_eq!(summary.checks_run, 1);
        assert_eq!(summary.checks_failed, 1);
        assert!(!summary.healthy);
        assert!(!summary.has_critical());
    }
}
