//! Billing errors

use thiserror::Error;

/// Result alias used across the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised while provisioning against the billing platform
#[derive(Debug, Error)]
pub enum BillingError {
    /// Raw failure reported by Stripe (auth rejection, invalid parameter,
    /// declined card, network fault). The message is passed through untouched.
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The customer has no payment method to attach after creation
    #[error("No payment method found for customer {0}")]
    NoPaymentMethod(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A workflow step failed. `created` lists every resource id that was
    /// already created and is now left live on the platform.
    #[error("Step '{step}' failed (created so far: {created:?}): {source}")]
    StepFailed {
        step: &'static str,
        created: Vec<String>,
        #[source]
        source: Box<BillingError>,
    },
}

impl BillingError {
    /// Unwrap `StepFailed` layers down to the platform-level cause
    pub fn root(&self) -> &BillingError {
        match self {
            BillingError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_nested_step_failures() {
        let err = BillingError::StepFailed {
            step: "create_subscription",
            created: vec!["prod_1".to_string(), "cus_1".to_string()],
            source: Box::new(BillingError::StripeApi("card declined".to_string())),
        };

        assert!(matches!(err.root(), BillingError::StripeApi(msg) if msg == "card declined"));
        let rendered = err.to_string();
        assert!(rendered.contains("create_subscription"));
        assert!(rendered.contains("cus_1"));
    }
}
