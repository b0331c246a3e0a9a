//! Billing platform seam
//!
//! [`BillingPlatform`] lists the remote calls the provisioning workflows make.
//! [`StripeClient`] implements it against the Stripe API; the in-memory
//! [`crate::mock::MockPlatform`] implements it for dry runs and tests.

use async_trait::async_trait;
use stripe::{
    AttachPaymentMethod, CreateCustomer, CreatePrice, CreateProduct, CreateSubscription, Customer,
    CustomerId, CustomerPaymentMethodRetrieval, PaymentMethod, PaymentMethodId, Price, Product,
    Subscription, UpdateCustomer,
};

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::models::{
    CreateMeterEventParams, CreateMeterParams, CreateMeteredPriceParams, Meter, MeterEvent,
    MeteredPrice,
};

/// Remote calls issued by the provisioning workflows, one method per endpoint
#[async_trait]
pub trait BillingPlatform: Send + Sync {
    async fn create_product(&self, params: CreateProduct<'_>) -> BillingResult<Product>;

    /// Licensed price, flat or per unit
    async fn create_price(&self, params: CreatePrice<'_>) -> BillingResult<Price>;

    /// Tiered price billed from a meter's aggregate
    async fn create_metered_price(
        &self,
        params: &CreateMeteredPriceParams,
    ) -> BillingResult<MeteredPrice>;

    async fn create_meter(&self, params: &CreateMeterParams) -> BillingResult<Meter>;

    async fn create_customer(&self, params: CreateCustomer<'_>) -> BillingResult<Customer>;

    /// Payment methods attached to a customer, in the order Stripe returns them
    async fn list_payment_methods(
        &self,
        customer_id: &CustomerId,
    ) -> BillingResult<Vec<PaymentMethod>>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &PaymentMethodId,
        params: AttachPaymentMethod,
    ) -> BillingResult<PaymentMethod>;

    async fn update_customer(
        &self,
        customer_id: &CustomerId,
        params: UpdateCustomer<'_>,
    ) -> BillingResult<Customer>;

    async fn create_subscription(
        &self,
        params: CreateSubscription<'_>,
    ) -> BillingResult<Subscription>;

    async fn create_meter_event(&self, params: &CreateMeterEventParams)
        -> BillingResult<MeterEvent>;
}

#[async_trait]
impl BillingPlatform for StripeClient {
    async fn create_product(&self, params: CreateProduct<'_>) -> BillingResult<Product> {
        let product = Product::create(self.inner(), params).await?;
        Ok(product)
    }

    async fn create_price(&self, params: CreatePrice<'_>) -> BillingResult<Price> {
        let price = Price::create(self.inner(), params).await?;
        Ok(price)
    }

    // CreatePriceRecurring has no `meter`, so the bound price is posted raw
    // and the binding read back from the untyped response.
    async fn create_metered_price(
        &self,
        params: &CreateMeteredPriceParams,
    ) -> BillingResult<MeteredPrice> {
        let body: serde_json::Value = self.inner().post_form("/prices", params).await?;
        MeteredPrice::from_response(body)
    }

    async fn create_meter(&self, params: &CreateMeterParams) -> BillingResult<Meter> {
        let meter: Meter = self.inner().post_form("/billing/meters", params).await?;
        Ok(meter)
    }

    async fn create_customer(&self, params: CreateCustomer<'_>) -> BillingResult<Customer> {
        let customer = Customer::create(self.inner(), params).await?;
        Ok(customer)
    }

    async fn list_payment_methods(
        &self,
        customer_id: &CustomerId,
    ) -> BillingResult<Vec<PaymentMethod>> {
        let list = Customer::retrieve_payment_methods(
            self.inner(),
            customer_id,
            CustomerPaymentMethodRetrieval::new(),
        )
        .await?;
        Ok(list.data)
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &PaymentMethodId,
        params: AttachPaymentMethod,
    ) -> BillingResult<PaymentMethod> {
        let attached = PaymentMethod::attach(self.inner(), payment_method_id, params).await?;
        Ok(attached)
    }

    async fn update_customer(
        &self,
        customer_id: &CustomerId,
        params: UpdateCustomer<'_>,
    ) -> BillingResult<Customer> {
        let customer = Customer::update(self.inner(), customer_id, params).await?;
        Ok(customer)
    }

    async fn create_subscription(
        &self,
        params: CreateSubscription<'_>,
    ) -> BillingResult<Subscription> {
        let subscription = Subscription::create(self.inner(), params).await?;
        Ok(subscription)
    }

    async fn create_meter_event(
        &self,
        params: &CreateMeterEventParams,
    ) -> BillingResult<MeterEvent> {
        let event: MeterEvent = self
            .inner()
            .post_form("/billing/meter_events", params)
            .await?;
        Ok(event)
    }
}
