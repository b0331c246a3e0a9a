//! Subscription binding

use serde::Serialize;
use stripe::{
    CreateSubscription, CreateSubscriptionItems, CustomerId, InvoiceId, PaymentIntentStatus,
    PriceId, Subscription, SubscriptionId, SubscriptionStatus,
};

use crate::error::BillingResult;
use crate::plans::EXPAND_LATEST_PAYMENT;
use crate::platform::BillingPlatform;

const SUBSCRIPTION_EXPAND: &[&str] = &[EXPAND_LATEST_PAYMENT];

/// A subscription line item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub price_id: PriceId,
    /// `None` for metered prices; usage determines the charge
    pub quantity: Option<u64>,
}

impl LineItem {
    /// Licensed price with an explicit quantity
    pub fn licensed(price_id: &PriceId, quantity: u64) -> Self {
        Self {
            price_id: price_id.clone(),
            quantity: Some(quantity),
        }
    }

    /// Price with the quantity left to Stripe's default (flat plans) or to
    /// reported usage (metered plans)
    pub fn unquantified(price_id: &PriceId) -> Self {
        Self {
            price_id: price_id.clone(),
            quantity: None,
        }
    }
}

/// Status of the first charge attempt, when the latest invoice and its
/// payment intent were expanded inline
pub fn first_charge_status(subscription: &Subscription) -> Option<PaymentIntentStatus> {
    subscription
        .latest_invoice
        .as_ref()
        .and_then(|invoice| invoice.as_object())
        .and_then(|invoice| invoice.payment_intent.as_ref())
        .and_then(|intent| intent.as_object())
        .map(|intent| intent.status)
}

/// What the caller learns from the subscription response
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionOutcome {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub status: SubscriptionStatus,
    pub latest_invoice_id: Option<InvoiceId>,
    /// Status of the first charge attempt (`succeeded`, `requires_action`, ...)
    pub first_charge_status: Option<PaymentIntentStatus>,
}

impl From<&Subscription> for SubscriptionOutcome {
    fn from(sub: &Subscription) -> Self {
        Self {
            subscription_id: sub.id.clone(),
            customer_id: sub.customer.id(),
            status: sub.status,
            latest_invoice_id: sub.latest_invoice.as_ref().map(|inv| inv.id()),
            first_charge_status: first_charge_status(sub),
        }
    }
}

/// Subscription service binding customers to prices
#[derive(Clone)]
pub struct SubscriptionService<P> {
    platform: P,
}

impl<P: BillingPlatform> SubscriptionService<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    /// Create a subscription for the customer. The response inlines the
    /// latest invoice's payment intent so the first charge outcome is known
    /// without a second call.
    pub async fn create_subscription(
        &self,
        customer_id: &CustomerId,
        items: &[LineItem],
    ) -> BillingResult<Subscription> {
        let subscription = self
            .platform
            .create_subscription(subscription_params(customer_id, items))
            .await?;
        let first_charge = first_charge_status(&subscription);

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %customer_id,
            items = items.len(),
            status = %subscription.status,
            first_charge = first_charge.map(|s| s.as_str()).unwrap_or("unknown"),
            "Created subscription"
        );

        if let Some(status) = first_charge {
            if status != PaymentIntentStatus::Succeeded {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    status = %status,
                    "First charge did not succeed"
                );
            }
        }

        Ok(subscription)
    }
}

pub(crate) fn subscription_params(
    customer_id: &CustomerId,
    items: &[LineItem],
) -> CreateSubscription<'static> {
    let mut params = CreateSubscription::new(customer_id.clone());
    params.items = Some(
        items
            .iter()
            .map(|item| CreateSubscriptionItems {
                price: Some(item.price_id.to_string()),
                quantity: item.quantity,
                ..Default::default()
            })
            .collect(),
    );
    params.expand = SUBSCRIPTION_EXPAND;
    params
}
