//! Customer onboarding

use serde::Serialize;
use stripe::{
    AttachPaymentMethod, CreateCustomer, Customer, CustomerId, CustomerInvoiceSettings,
    PaymentMethodId, UpdateCustomer,
};

use crate::error::{BillingError, BillingResult};
use crate::plans::CustomerProfile;
use crate::platform::BillingPlatform;

/// Customer with a default invoicing payment method
#[derive(Debug, Clone, Serialize)]
pub struct OnboardedCustomer {
    pub customer_id: CustomerId,
    pub email: Option<String>,
    pub default_payment_method: PaymentMethodId,
}

/// Customer service for creating payers and wiring up their payment method
#[derive(Clone)]
pub struct CustomerService<P> {
    platform: P,
}

impl<P: BillingPlatform> CustomerService<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    /// Create the customer with the profile's payment token. An empty token
    /// creates the customer without any payment method.
    pub async fn create_customer(&self, profile: &CustomerProfile) -> BillingResult<Customer> {
        let payment_method = match profile.payment_token.as_str() {
            "" => None,
            token => Some(token.parse::<PaymentMethodId>().map_err(|e| {
                BillingError::Config(format!("Invalid payment token '{}': {}", token, e))
            })?),
        };

        let params = CreateCustomer {
            email: Some(&profile.email),
            name: Some(&profile.name),
            payment_method,
            ..Default::default()
        };
        let customer = self.platform.create_customer(params).await?;

        tracing::info!(customer_id = %customer.id, email = %profile.email, "Created customer");
        Ok(customer)
    }

    /// Attach the customer's first listed payment method and make it the
    /// default for invoices.
    ///
    /// Attachment always precedes marking default.
    pub async fn set_default_payment_method(
        &self,
        customer_id: &CustomerId,
    ) -> BillingResult<PaymentMethodId> {
        let methods = self.platform.list_payment_methods(customer_id).await?;
        let payment_method_id = methods
            .into_iter()
            .next()
            .map(|pm| pm.id)
            .ok_or_else(|| BillingError::NoPaymentMethod(customer_id.to_string()))?;

        self.platform
            .attach_payment_method(
                &payment_method_id,
                AttachPaymentMethod {
                    customer: customer_id.clone(),
                },
            )
            .await?;
        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Attached payment method"
        );

        let params = UpdateCustomer {
            invoice_settings: Some(CustomerInvoiceSettings {
                default_payment_method: Some(payment_method_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.platform.update_customer(customer_id, params).await?;
        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Set default invoice payment method"
        );

        Ok(payment_method_id)
    }

    /// Create the customer, then attach and default its payment method
    pub async fn onboard(&self, profile: &CustomerProfile) -> BillingResult<OnboardedCustomer> {
        let customer = self.create_customer(profile).await?;
        let default_payment_method = self.set_default_payment_method(&customer.id).await?;

        Ok(OnboardedCustomer {
            customer_id: customer.id,
            email: customer.email,
            default_payment_method,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CallKind, MockPlatform};

    #[tokio::test]
    async fn test_onboard_sets_listed_method_as_default() {
        let platform = MockPlatform::new();
        let service = CustomerService::new(platform.clone());

        let onboarded = service.onboard(&CustomerProfile::test_user_a()).await.unwrap();

        assert!(onboarded.customer_id.starts_with("cus_"));
        assert!(onboarded.default_payment_method.starts_with("pm_"));
        assert_eq!(
            platform.default_payment_method(&onboarded.customer_id),
            Some(onboarded.default_payment_method.clone())
        );
        assert_eq!(
            platform.call_kinds(),
            vec![
                CallKind::CreateCustomer,
                CallKind::ListPaymentMethods,
                CallKind::AttachPaymentMethod,
                CallKind::UpdateCustomer,
            ]
        );

        let created = &platform.params_of(CallKind::CreateCustomer)[0];
        assert_eq!(created["email"], "testuserA@steamingexample.com");
        assert_eq!(created["payment_method"], "pm_card_visa");
    }

    #[tokio::test]
    async fn test_no_payment_method_aborts_before_attach() {
        let platform = MockPlatform::new();
        let service = CustomerService::new(platform.clone());

        let mut profile = CustomerProfile::test_user_b();
        profile.payment_token = String::new();

        let err = service.onboard(&profile).await.unwrap_err();
        assert!(matches!(err, BillingError::NoPaymentMethod(_)));
        assert!(platform.params_of(CallKind::CreateCustomer)[0]
            .get("payment_method")
            .is_none());
        assert!(!platform.call_kinds().contains(&CallKind::AttachPaymentMethod));
        assert!(!platform.call_kinds().contains(&CallKind::UpdateCustomer));
    }

    #[tokio::test]
    async fn test_malformed_token_rejected_before_any_call() {
        let platform = MockPlatform::new();
        let service = CustomerService::new(platform.clone());

        let mut profile = CustomerProfile::test_user_a();
        profile.payment_token = "tok_visa".to_string();

        let err = service.onboard(&profile).await.unwrap_err();
        assert!(matches!(err, BillingError::Config(ref m) if m.contains("tok_visa")));
        assert!(platform.calls().is_empty());
    }
}
