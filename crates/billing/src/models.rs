//! Billing meter wire types
//!
//! async-stripe 0.39 has no billing meter resources, and its `CreatePriceRecurring`
//! cannot carry the `recurring[meter]` binding of a metered price. These three
//! calls are form-encoded from the structs below, so field names here are the
//! wire contract. Everything else goes through the typed `stripe` API.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stripe::{
    CreatePriceRecurringInterval, CreatePriceRecurringUsageType, CreatePriceTiers, Currency, Price,
    PriceBillingScheme, PriceTiersMode, ProductId,
};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFormula {
    Sum,
    Count,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerMappingType {
    ById,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterAggregation {
    pub formula: AggregationFormula,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterCustomerMapping {
    /// Payload key that carries the Stripe customer id
    pub event_payload_key: String,
    #[serde(rename = "type")]
    pub mapping_type: CustomerMappingType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValueSettings {
    /// Payload key that carries the numeric usage value
    pub event_payload_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateMeterParams {
    pub display_name: String,
    pub event_name: String,
    pub default_aggregation: MeterAggregation,
    pub customer_mapping: MeterCustomerMapping,
    pub value_settings: MeterValueSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meter {
    pub id: String,
    pub display_name: String,
    pub event_name: String,
    pub default_aggregation: MeterAggregation,
    pub customer_mapping: MeterCustomerMapping,
    pub value_settings: MeterValueSettings,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateMeterEventParams {
    pub event_name: String,
    pub payload: BTreeMap<String, String>,
}

/// A single usage observation. Stripe identifies meter events by
/// `identifier` rather than `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterEvent {
    pub identifier: String,
    pub event_name: String,
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeteredPriceRecurring {
    pub interval: CreatePriceRecurringInterval,
    pub usage_type: CreatePriceRecurringUsageType,
    /// Meter whose aggregate feeds this price
    pub meter: String,
}

/// `POST /v1/prices` for a tiered price billed from a meter
#[derive(Debug, Clone, Serialize)]
pub struct CreateMeteredPriceParams {
    pub product: ProductId,
    pub currency: Currency,
    pub billing_scheme: PriceBillingScheme,
    pub recurring: MeteredPriceRecurring,
    pub tiers_mode: PriceTiersMode,
    pub tiers: Vec<CreatePriceTiers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// A created price together with the meter Stripe reports it is bound to
#[derive(Debug, Clone)]
pub struct MeteredPrice {
    pub price: Price,
    /// `recurring.meter` of the response, absent when Stripe did not echo it
    pub meter: Option<String>,
}

impl MeteredPrice {
    /// Split a raw price response into the typed price and its meter binding
    pub fn from_response(body: serde_json::Value) -> BillingResult<Self> {
        let meter = body
            .pointer("/recurring/meter")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        let price: Price = serde_json::from_value(body)?;

        Ok(Self { price, meter })
    }
}

/// Parse a Stripe id returned by the API into its typed form
pub(crate) fn parse_id<T>(raw: &str) -> BillingResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid ID '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripe::{RecurringUsageType, UpTo, UpToOther};

    #[test]
    fn test_customer_mapping_type_renamed() {
        let mapping = MeterCustomerMapping {
            event_payload_key: "stripe_customer_id".to_string(),
            mapping_type: CustomerMappingType::ById,
        };

        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["type"], "by_id");
        assert_eq!(json["event_payload_key"], "stripe_customer_id");
    }

    #[test]
    fn test_metered_price_form_carries_meter_and_inf_tier() {
        let params = CreateMeteredPriceParams {
            product: "prod_1".parse().unwrap(),
            currency: Currency::USD,
            billing_scheme: PriceBillingScheme::Tiered,
            recurring: MeteredPriceRecurring {
                interval: CreatePriceRecurringInterval::Month,
                usage_type: CreatePriceRecurringUsageType::Metered,
                meter: "mtr_1".to_string(),
            },
            tiers_mode: PriceTiersMode::Graduated,
            tiers: vec![
                CreatePriceTiers {
                    up_to: Some(UpTo::Max(100)),
                    unit_amount_decimal: Some("0".to_string()),
                    ..Default::default()
                },
                CreatePriceTiers {
                    up_to: Some(UpTo::Other(UpToOther::Inf)),
                    unit_amount_decimal: Some("10".to_string()),
                    ..Default::default()
                },
            ],
            nickname: None,
        };

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["product"], "prod_1");
        assert_eq!(json["currency"], "usd");
        assert_eq!(json["recurring"]["meter"], "mtr_1");
        assert_eq!(json["recurring"]["usage_type"], "metered");
        assert_eq!(json["tiers"][0]["up_to"], 100);
        assert_eq!(json["tiers"][1]["up_to"], "inf");
        assert!(json["tiers"][1].get("flat_amount").is_none());
        assert!(json.get("nickname").is_none());
    }

    #[test]
    fn test_metered_price_response_keeps_meter_binding() {
        let body = serde_json::json!({
            "id": "price_o",
            "object": "price",
            "currency": "usd",
            "billing_scheme": "tiered",
            "recurring": {
                "interval": "month",
                "interval_count": 1,
                "usage_type": "metered",
                "meter": "mtr_1"
            }
        });

        let priced = MeteredPrice::from_response(body).unwrap();
        assert_eq!(priced.price.id.as_str(), "price_o");
        assert_eq!(priced.meter.as_deref(), Some("mtr_1"));
        assert_eq!(
            priced.price.recurring.unwrap().usage_type,
            RecurringUsageType::Metered
        );
    }

    #[test]
    fn test_metered_price_response_without_meter() {
        let body = serde_json::json!({
            "id": "price_o",
            "recurring": { "interval": "month", "interval_count": 1, "usage_type": "metered" }
        });

        let priced = MeteredPrice::from_response(body).unwrap();
        assert!(priced.meter.is_none());
    }

    #[test]
    fn test_parse_id_rejects_wrong_prefix() {
        assert!(parse_id::<stripe::CustomerId>("cus_123").is_ok());
        let err = parse_id::<stripe::CustomerId>("pm_123").unwrap_err();
        assert!(matches!(err, BillingError::StripeApi(ref m) if m.contains("pm_123")));
    }
}
