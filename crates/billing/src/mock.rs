//! In-memory billing platform
//!
//! Records every call in order and answers with Stripe-shaped objects. Backs
//! `--dry-run` and the workflow tests. Rejections follow Stripe's behaviour
//! for the cases the workflows can hit (unknown ids, duplicate meter event
//! names, defaulting an unattached payment method).

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use stripe::{
    AttachPaymentMethod, CreateCustomer, CreatePrice, CreatePriceRecurringInterval,
    CreatePriceRecurringUsageType, CreateProduct, CreateSubscription, Currency, Customer,
    CustomerId, Expandable, IdOrCreate, Invoice, InvoiceSettingCustomerSetting, InvoiceStatus,
    List, PaymentIntent, PaymentIntentStatus, PaymentMethod, PaymentMethodId, PaymentMethodType,
    Price, Product, Recurring, RecurringInterval, RecurringUsageType, Subscription,
    SubscriptionItem, SubscriptionStatus, UpdateCustomer,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    parse_id, CreateMeterEventParams, CreateMeterParams, CreateMeteredPriceParams, Meter,
    MeterEvent, MeteredPrice,
};
use crate::plans::EXPAND_LATEST_PAYMENT;
use crate::platform::BillingPlatform;

const BILLING_PERIOD_SECS: i64 = 30 * 24 * 60 * 60;

/// Kind of platform call, for ordering assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    CreateProduct,
    CreatePrice,
    CreateMeter,
    CreateCustomer,
    ListPaymentMethods,
    AttachPaymentMethod,
    UpdateCustomer,
    CreateSubscription,
    CreateMeterEvent,
}

/// A recorded call with the parameters it was issued with
#[derive(Debug, Clone)]
pub struct PlatformCall {
    pub kind: CallKind,
    /// Id in the request path (customer or payment method), if any
    pub target: Option<String>,
    /// Request parameters as serialized for Stripe
    pub params: serde_json::Value,
}

#[derive(Default)]
struct MockState {
    calls: Vec<PlatformCall>,
    products: HashMap<String, Product>,
    prices: HashMap<String, Price>,
    meters: Vec<Meter>,
    customers: HashMap<String, Customer>,
    payment_methods: Vec<PaymentMethod>,
    subscriptions: Vec<Subscription>,
    meter_events: Vec<MeterEvent>,
    fail_on: Option<(CallKind, String)>,
    omit_meter_binding: bool,
}

impl MockState {
    /// Record the call, then fail it if a failure was injected for its kind
    fn record<T: Serialize>(
        &mut self,
        kind: CallKind,
        target: Option<&str>,
        params: &T,
    ) -> BillingResult<()> {
        self.calls.push(PlatformCall {
            kind,
            target: target.map(str::to_string),
            params: serde_json::to_value(params)?,
        });

        match self.fail_on.take() {
            Some((fail_kind, message)) if fail_kind == kind => {
                Err(BillingError::StripeApi(message))
            }
            other => {
                self.fail_on = other;
                Ok(())
            }
        }
    }

    fn customer_mut(&mut self, customer_id: &CustomerId) -> BillingResult<&mut Customer> {
        self.customers
            .get_mut(customer_id.as_str())
            .ok_or_else(|| no_such("customer", customer_id))
    }

    fn require_product(&self, product_id: &str) -> BillingResult<()> {
        if self.products.contains_key(product_id) {
            Ok(())
        } else {
            Err(no_such("product", product_id))
        }
    }
}

fn raw_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

fn new_id<T>(prefix: &str) -> BillingResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = raw_id(prefix);
    raw.parse::<T>()
        .map_err(|e| BillingError::Internal(format!("Generated id '{}' rejected: {}", raw, e)))
}

fn no_such(resource: &str, id: &str) -> BillingError {
    BillingError::StripeApi(format!("No such {}: '{}'", resource, id))
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn owner(pm: &PaymentMethod) -> Option<CustomerId> {
    pm.customer.as_ref().map(|c| c.id())
}

fn recurring(
    interval: CreatePriceRecurringInterval,
    interval_count: Option<u64>,
    usage_type: Option<CreatePriceRecurringUsageType>,
) -> Recurring {
    Recurring {
        interval: match interval {
            CreatePriceRecurringInterval::Day => RecurringInterval::Day,
            CreatePriceRecurringInterval::Week => RecurringInterval::Week,
            CreatePriceRecurringInterval::Month => RecurringInterval::Month,
            CreatePriceRecurringInterval::Year => RecurringInterval::Year,
        },
        interval_count: interval_count.unwrap_or(1),
        usage_type: match usage_type {
            Some(CreatePriceRecurringUsageType::Metered) => RecurringUsageType::Metered,
            _ => RecurringUsageType::Licensed,
        },
        ..Default::default()
    }
}

/// In-memory stand-in for Stripe
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next call of `kind` with a Stripe error carrying `message`
    pub fn fail_on(&self, kind: CallKind, message: &str) {
        self.state().fail_on = Some((kind, message.to_string()));
    }

    /// Answer metered price creation without `recurring.meter`. The price is
    /// still bound on the platform; only the response leaves it out.
    pub fn omit_meter_binding(&self) {
        self.state().omit_meter_binding = true;
    }

    /// Every call issued so far, in order
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state().calls.clone()
    }

    pub fn call_kinds(&self) -> Vec<CallKind> {
        self.state().calls.iter().map(|c| c.kind).collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.kind == kind).count()
    }

    /// Parameters of every call of `kind`, in order
    pub fn params_of(&self, kind: CallKind) -> Vec<serde_json::Value> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.params.clone())
            .collect()
    }

    pub fn products(&self) -> Vec<Product> {
        self.state().products.values().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state().subscriptions.clone()
    }

    pub fn meter_events(&self) -> Vec<MeterEvent> {
        self.state().meter_events.clone()
    }

    pub fn default_payment_method(&self, customer_id: &str) -> Option<PaymentMethodId> {
        self.state()
            .customers
            .get(customer_id)
            .and_then(|c| c.invoice_settings.as_ref())
            .and_then(|s| s.default_payment_method.as_ref())
            .map(|pm| pm.id())
    }

    /// Usage aggregated by the meter registered for `event_name`, summed over
    /// the customer's events. Events whose name matches no meter, or whose
    /// payload lacks the meter's keys, are never aggregated.
    pub fn aggregated_usage(&self, event_name: &str, customer_id: &str) -> f64 {
        let state = self.state();
        let Some(meter) = state.meters.iter().find(|m| m.event_name == event_name) else {
            return 0.0;
        };
        let customer_key = &meter.customer_mapping.event_payload_key;
        let value_key = &meter.value_settings.event_payload_key;

        state
            .meter_events
            .iter()
            .filter(|e| e.event_name == event_name)
            .filter(|e| e.payload.get(customer_key).map(String::as_str) == Some(customer_id))
            .filter_map(|e| e.payload.get(value_key))
            .filter_map(|v| v.parse::<f64>().ok())
            .sum()
    }
}

#[async_trait]
impl BillingPlatform for MockPlatform {
    async fn create_product(&self, params: CreateProduct<'_>) -> BillingResult<Product> {
        let mut state = self.state();
        state.record(CallKind::CreateProduct, None, &params)?;

        let product = Product {
            id: new_id("prod")?,
            name: Some(params.name.to_string()),
            description: params.description.map(str::to_string),
            active: Some(true),
            created: Some(now()),
            ..Default::default()
        };
        state
            .products
            .insert(product.id.to_string(), product.clone());
        Ok(product)
    }

    async fn create_price(&self, params: CreatePrice<'_>) -> BillingResult<Price> {
        let mut state = self.state();
        state.record(CallKind::CreatePrice, None, &params)?;

        let product_id = match &params.product {
            Some(IdOrCreate::Id(id)) => *id,
            _ => {
                return Err(BillingError::StripeApi(
                    "Missing required param: product.".to_string(),
                ))
            }
        };
        state.require_product(product_id)?;

        let price = Price {
            id: new_id("price")?,
            active: Some(true),
            billing_scheme: params.billing_scheme,
            created: Some(now()),
            currency: Some(params.currency),
            nickname: params.nickname.map(str::to_string),
            product: Some(Expandable::Id(parse_id(product_id)?)),
            recurring: params
                .recurring
                .as_ref()
                .map(|r| recurring(r.interval, r.interval_count, r.usage_type)),
            tiers_mode: params.tiers_mode,
            unit_amount: params.unit_amount,
            ..Default::default()
        };
        state.prices.insert(price.id.to_string(), price.clone());
        Ok(price)
    }

    async fn create_metered_price(
        &self,
        params: &CreateMeteredPriceParams,
    ) -> BillingResult<MeteredPrice> {
        let mut state = self.state();
        state.record(CallKind::CreatePrice, None, params)?;

        state.require_product(params.product.as_str())?;
        let meter_id = &params.recurring.meter;
        if !state.meters.iter().any(|m| &m.id == meter_id) {
            return Err(no_such("billing.meter", meter_id));
        }

        let price = Price {
            id: new_id("price")?,
            active: Some(true),
            billing_scheme: Some(params.billing_scheme),
            created: Some(now()),
            currency: Some(params.currency),
            nickname: params.nickname.clone(),
            product: Some(Expandable::Id(params.product.clone())),
            recurring: Some(recurring(
                params.recurring.interval,
                None,
                Some(params.recurring.usage_type),
            )),
            tiers_mode: Some(params.tiers_mode),
            ..Default::default()
        };
        state.prices.insert(price.id.to_string(), price.clone());

        let meter = (!state.omit_meter_binding).then(|| meter_id.clone());
        Ok(MeteredPrice { price, meter })
    }

    async fn create_meter(&self, params: &CreateMeterParams) -> BillingResult<Meter> {
        let mut state = self.state();
        state.record(CallKind::CreateMeter, None, params)?;

        if state.meters.iter().any(|m| m.event_name == params.event_name) {
            return Err(BillingError::StripeApi(format!(
                "An active meter with event_name '{}' already exists",
                params.event_name
            )));
        }

        let meter = Meter {
            id: raw_id("mtr"),
            display_name: params.display_name.clone(),
            event_name: params.event_name.clone(),
            default_aggregation: params.default_aggregation.clone(),
            customer_mapping: params.customer_mapping.clone(),
            value_settings: params.value_settings.clone(),
            status: Some("active".to_string()),
        };
        state.meters.push(meter.clone());
        Ok(meter)
    }

    async fn create_customer(&self, params: CreateCustomer<'_>) -> BillingResult<Customer> {
        let mut state = self.state();
        state.record(CallKind::CreateCustomer, None, &params)?;

        let customer = Customer {
            id: new_id("cus")?,
            email: params.email.map(str::to_string),
            name: params.name.map(str::to_string),
            created: Some(now()),
            invoice_settings: Some(InvoiceSettingCustomerSetting::default()),
            ..Default::default()
        };

        // Stripe turns a test token into a fresh card payment method attached
        // to the new customer
        if params.payment_method.is_some() {
            let method = PaymentMethod {
                id: new_id("pm")?,
                customer: Some(Expandable::Id(customer.id.clone())),
                type_: PaymentMethodType::Card,
                created: now(),
                ..Default::default()
            };
            state.payment_methods.push(method);
        }

        state
            .customers
            .insert(customer.id.to_string(), customer.clone());
        Ok(customer)
    }

    async fn list_payment_methods(
        &self,
        customer_id: &CustomerId,
    ) -> BillingResult<Vec<PaymentMethod>> {
        let mut state = self.state();
        state.record(
            CallKind::ListPaymentMethods,
            Some(customer_id.as_str()),
            &serde_json::json!({}),
        )?;

        if !state.customers.contains_key(customer_id.as_str()) {
            return Err(no_such("customer", customer_id));
        }

        Ok(state
            .payment_methods
            .iter()
            .filter(|pm| owner(pm).as_ref() == Some(customer_id))
            .cloned()
            .collect())
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &PaymentMethodId,
        params: AttachPaymentMethod,
    ) -> BillingResult<PaymentMethod> {
        let mut state = self.state();
        state.record(
            CallKind::AttachPaymentMethod,
            Some(payment_method_id.as_str()),
            &params,
        )?;

        if !state.customers.contains_key(params.customer.as_str()) {
            return Err(no_such("customer", &params.customer));
        }

        let pm = state
            .payment_methods
            .iter_mut()
            .find(|pm| &pm.id == payment_method_id)
            .ok_or_else(|| no_such("payment_method", payment_method_id))?;

        if let Some(current) = owner(pm) {
            if current != params.customer {
                return Err(BillingError::StripeApi(format!(
                    "The payment method '{}' is already attached to another customer",
                    payment_method_id
                )));
            }
        }

        pm.customer = Some(Expandable::Id(params.customer));
        Ok(pm.clone())
    }

    async fn update_customer(
        &self,
        customer_id: &CustomerId,
        params: UpdateCustomer<'_>,
    ) -> BillingResult<Customer> {
        let mut state = self.state();
        state.record(CallKind::UpdateCustomer, Some(customer_id.as_str()), &params)?;

        let requested_default = params
            .invoice_settings
            .as_ref()
            .and_then(|s| s.default_payment_method.clone());

        if let Some(pm_id) = requested_default {
            let attached = state
                .payment_methods
                .iter()
                .any(|pm| pm.id == pm_id && owner(pm).as_ref() == Some(customer_id));
            if !attached {
                return Err(BillingError::StripeApi(format!(
                    "The payment method '{}' must be attached to customer '{}' before it can be set as default",
                    pm_id, customer_id
                )));
            }

            let default_payment_method = parse_id::<PaymentMethodId>(&pm_id)?;
            let customer = state.customer_mut(customer_id)?;
            customer.invoice_settings = Some(InvoiceSettingCustomerSetting {
                default_payment_method: Some(Expandable::Id(default_payment_method)),
                ..Default::default()
            });
        }

        Ok(state.customer_mut(customer_id)?.clone())
    }

    async fn create_subscription(
        &self,
        params: CreateSubscription<'_>,
    ) -> BillingResult<Subscription> {
        let mut state = self.state();
        state.record(CallKind::CreateSubscription, None, &params)?;

        let has_default = state
            .customers
            .get(params.customer.as_str())
            .ok_or_else(|| no_such("customer", &params.customer))?
            .invoice_settings
            .as_ref()
            .is_some_and(|s| s.default_payment_method.is_some());

        let subscription_id = new_id("sub")?;
        let requested = params.items.as_deref().unwrap_or_default();
        let mut items = Vec::with_capacity(requested.len());
        let mut amount_due = 0i64;
        for item in requested {
            let price_id = item.price.as_deref().unwrap_or_default();
            let price = state
                .prices
                .get(price_id)
                .cloned()
                .ok_or_else(|| no_such("price", price_id))?;
            let metered = price
                .recurring
                .as_ref()
                .is_some_and(|r| r.usage_type == RecurringUsageType::Metered);
            let quantity = if metered {
                None
            } else {
                Some(item.quantity.unwrap_or(1))
            };

            // metered lines are billed in arrears, so the first invoice only
            // charges licensed lines
            let units = i64::try_from(quantity.unwrap_or(0)).unwrap_or(i64::MAX);
            amount_due =
                amount_due.saturating_add(price.unit_amount.unwrap_or(0).saturating_mul(units));

            items.push(SubscriptionItem {
                id: new_id("si")?,
                price: Some(price),
                quantity,
                created: Some(now()),
                ..Default::default()
            });
        }

        let (status, intent_status, invoice_status) = if has_default {
            (
                SubscriptionStatus::Active,
                PaymentIntentStatus::Succeeded,
                InvoiceStatus::Paid,
            )
        } else {
            (
                SubscriptionStatus::Incomplete,
                PaymentIntentStatus::RequiresPaymentMethod,
                InvoiceStatus::Open,
            )
        };

        let started = now();
        let invoice = Invoice {
            id: new_id("in")?,
            status: Some(invoice_status),
            amount_due: Some(amount_due),
            payment_intent: Some(Expandable::Object(Box::new(PaymentIntent {
                id: new_id("pi")?,
                amount: amount_due,
                amount_received: if has_default { amount_due } else { 0 },
                currency: Currency::USD,
                created: started,
                status: intent_status,
                ..Default::default()
            }))),
            ..Default::default()
        };
        let latest_invoice = if params.expand.contains(&EXPAND_LATEST_PAYMENT) {
            Expandable::Object(Box::new(invoice))
        } else {
            Expandable::Id(invoice.id)
        };

        let item_count = items.len() as u64;
        let subscription = Subscription {
            items: List {
                data: items,
                has_more: false,
                total_count: Some(item_count),
                url: format!("/v1/subscription_items?subscription={}", subscription_id),
            },
            id: subscription_id,
            customer: Expandable::Id(params.customer.clone()),
            status,
            latest_invoice: Some(latest_invoice),
            currency: Currency::USD,
            created: started,
            start_date: started,
            billing_cycle_anchor: started,
            current_period_start: started,
            current_period_end: started + BILLING_PERIOD_SECS,
            ..Default::default()
        };
        state.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn create_meter_event(
        &self,
        params: &CreateMeterEventParams,
    ) -> BillingResult<MeterEvent> {
        let mut state = self.state();
        state.record(CallKind::CreateMeterEvent, None, params)?;

        let event = MeterEvent {
            identifier: raw_id("mev"),
            event_name: params.event_name.clone(),
            payload: params.payload.clone(),
            created: Some(now()),
        };
        state.meter_events.push(event.clone());
        Ok(event)
    }
}
