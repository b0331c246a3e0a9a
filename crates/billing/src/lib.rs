// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::StepFailed carries the created-id list
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Streamplan Billing Module
//!
//! Provisions streaming subscription plans on Stripe in one linear run.
//!
//! ## Features
//!
//! - **Catalog Setup**: product plus flat price, or licensed base price,
//!   usage meter and tiered overage price
//! - **Customer Onboarding**: customer with an attached default payment method
//! - **Subscription Binding**: subscription with the first charge outcome inline
//! - **Usage Reporting**: meter events keyed the way the meter expects
//! - **Invariants**: offline checks that meter, prices and events line up
//! - **Mock Platform**: in-memory Stripe stand-in for dry runs and tests

pub mod catalog;
pub mod client;
pub mod customer;
pub mod error;
pub mod invariants;
pub mod metered;
pub mod mock;
pub mod models;
pub mod plans;
pub mod platform;
pub mod subscriptions;
pub mod workflow;


// Catalog
pub use catalog::{CatalogIds, CatalogService, FlatCatalog, MeteredCatalog};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::{CustomerService, OnboardedCustomer};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Metered
pub use metered::{MeteredBillingService, UsageReportResponse};

// Mock
pub use mock::{CallKind, MockPlatform, PlatformCall};

// Models
pub use models::{Meter, MeterEvent, MeteredPrice};

// Plans
pub use plans::{CustomerProfile, FlatPlan, MeteredPlan, PriceTier, DEFAULT_USAGE_VALUE, UNBOUNDED};

// Platform
pub use platform::BillingPlatform;

// Subscriptions
pub use subscriptions::{first_charge_status, LineItem, SubscriptionOutcome, SubscriptionService};

// Workflow
pub use workflow::{FlatPlanReport, MeteredPlanReport};

/// Main billing service that combines all provisioning functionality
pub struct BillingService<P = StripeClient> {
    pub catalog: CatalogService<P>,
    pub customer: CustomerService<P>,
    pub subscriptions: SubscriptionService<P>,
    pub metered: MeteredBillingService<P>,
    pub invariants: InvariantChecker,
}

impl BillingService<StripeClient> {
    /// Create a new billing service from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_platform(stripe))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        config.validate()?;
        Ok(Self::with_platform(StripeClient::new(config)))
    }
}

impl<P: BillingPlatform + Clone> BillingService<P> {
    /// Create a billing service over any platform implementation
    pub fn with_platform(platform: P) -> Self {
        Self {
            catalog: CatalogService::new(platform.clone()),
            customer: CustomerService::new(platform.clone()),
            subscriptions: SubscriptionService::new(platform.clone()),
            metered: MeteredBillingService::new(platform),
            invariants: InvariantChecker::new(),
        }
    }
}
