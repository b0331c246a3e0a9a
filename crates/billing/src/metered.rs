//! Metered usage reporting
//!
//! Usage is reported as meter events that Stripe aggregates per customer with
//! the meter's formula, then prices against the overage tier table on the
//! next invoice.
//!
//! Events are sent without an `identifier`, so Stripe cannot deduplicate
//! them: reporting the same usage twice records two events and bills twice
//! the usage.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::BillingResult;
use crate::models::{CreateMeterEventParams, Meter, MeterEvent};
use crate::platform::BillingPlatform;

/// Result of a usage report
#[derive(Debug, Clone, Serialize)]
pub struct UsageReportResponse {
    pub event_identifier: String,
    pub event_name: String,
    pub customer_id: String,
    pub value: String,
}

/// Reports usage against a meter
#[derive(Clone)]
pub struct MeteredBillingService<P> {
    platform: P,
}

impl<P: BillingPlatform> MeteredBillingService<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    /// Emit one usage event for the customer. The payload keys come from the
    /// meter itself, so the event always matches the meter's mapping.
    pub async fn report_usage(
        &self,
        meter: &Meter,
        customer_id: &str,
        value: &str,
    ) -> BillingResult<UsageReportResponse> {
        let params = meter_event_params(meter, customer_id, value);
        let event: MeterEvent = self.platform.create_meter_event(&params).await?;

        tracing::info!(
            event_identifier = %event.identifier,
            event_name = %params.event_name,
            customer_id = %customer_id,
            value = %value,
            "Reported meter event"
        );

        Ok(UsageReportResponse {
            event_identifier: event.identifier,
            event_name: params.event_name,
            customer_id: customer_id.to_string(),
            value: value.to_string(),
        })
    }
}

/// Meter event whose payload uses the meter's value key and customer
/// mapping key
pub fn meter_event_params(meter: &Meter, customer_id: &str, value: &str) -> CreateMeterEventParams {
    let mut payload = BTreeMap::new();
    payload.insert(
        meter.value_settings.event_payload_key.clone(),
        value.to_string(),
    );
    payload.insert(
        meter.customer_mapping.event_payload_key.clone(),
        customer_id.to_string(),
    );

    CreateMeterEventParams {
        event_name: meter.event_name.clone(),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogService;
    use crate::mock::MockPlatform;
    use crate::models::{
        AggregationFormula, CustomerMappingType, MeterAggregation, MeterCustomerMapping,
        MeterValueSettings,
    };
    use crate::plans::MeteredPlan;

    fn meter() -> Meter {
        Meter {
            id: "mtr_test".to_string(),
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
            status: Some("active".to_string()),
        }
    }

    #[test]
    fn test_payload_keys_follow_meter() {
        let params = meter_event_params(&meter(), "cus_42", "150");

        assert_eq!(params.event_name, "streaming_per_gb");
        let keys: Vec<&str> = params.payload.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["stripe_customer_id", "value"]);
        assert_eq!(params.payload["value"], "150");
        assert_eq!(params.payload["stripe_customer_id"], "cus_42");
    }

    #[tokio::test]
    async fn test_report_usage_twice_double_counts() {
        let platform = MockPlatform::new();
        let service = MeteredBillingService::new(platform.clone());
        let meter = CatalogService::new(platform.clone())
            .create_meter(&MeteredPlan::streaming_per_gb())
            .await
            .unwrap();

        let first = service.report_usage(&meter, "cus_42", "150").await.unwrap();
        let second = service.report_usage(&meter, "cus_42", "150").await.unwrap();

        assert_ne!(first.event_identifier, second.event_identifier);
        assert_eq!(platform.meter_events().len(), 2);
        assert_eq!(platform.aggregated_usage("streaming_per_gb", "cus_42"), 300.0);
    }

    #[tokio::test]
    async fn test_event_for_unknown_meter_is_silently_dropped() {
        let platform = MockPlatform::new();
        let service = MeteredBillingService::new(platform.clone());

        // Meter never created on the platform: the event is accepted but
        // nothing aggregates it
        service.report_usage(&meter(), "cus_42", "150").await.unwrap();

        assert_eq!(platform.meter_events().len(), 1);
        assert_eq!(platform.aggregated_usage("streaming_per_gb", "cus_42"), 0.0);
    }
}
