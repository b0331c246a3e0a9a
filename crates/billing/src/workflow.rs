//! Provisioning workflows
//!
//! Each workflow is a straight-line sequence of platform calls: every step
//! needs an id returned by an earlier one, nothing is retried and nothing is
//! rolled back. When a step fails the run stops with
//! [`BillingError::StepFailed`], listing what was already created so it can be
//! removed by hand.

use std::future::Future;

use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::{CatalogIds, FlatCatalog, MeteredCatalog};
use crate::customer::OnboardedCustomer;
use crate::error::{BillingError, BillingResult};
use crate::invariants::InvariantCheckSummary;
use crate::metered::{meter_event_params, UsageReportResponse};
use crate::plans::{CustomerProfile, FlatPlan, MeteredPlan};
use crate::platform::BillingPlatform;
use crate::subscriptions::{LineItem, SubscriptionOutcome};
use crate::BillingService;

/// Report of a flat plan run
#[derive(Debug, Clone, Serialize)]
pub struct FlatPlanReport {
    pub catalog: CatalogIds,
    pub customer: OnboardedCustomer,
    pub subscription: SubscriptionOutcome,
    pub invariants: InvariantCheckSummary,
    #[serde(with = "time::serde::timestamp")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub finished_at: OffsetDateTime,
}

/// Report of a metered plan run
#[derive(Debug, Clone, Serialize)]
pub struct MeteredPlanReport {
    pub catalog: CatalogIds,
    pub customer: OnboardedCustomer,
    pub subscription: SubscriptionOutcome,
    /// `None` when usage reporting was skipped
    pub usage: Option<UsageReportResponse>,
    /// Overage the reported event alone would add to the next invoice
    pub estimated_overage_cents: Option<u64>,
    pub invariants: InvariantCheckSummary,
    #[serde(with = "time::serde::timestamp")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub finished_at: OffsetDateTime,
}

/// Ids created so far in a run
#[derive(Debug, Default)]
struct Progress {
    created: Vec<String>,
}

impl Progress {
    /// Await one step, tagging a failure with the step name and the ids
    /// created before it
    async fn step<T, F>(&self, step: &'static str, fut: F) -> BillingResult<T>
    where
        F: Future<Output = BillingResult<T>>,
    {
        fut.await.map_err(|source| {
            tracing::error!(
                step = step,
                created = ?self.created,
                error = %source,
                "Provisioning step failed; created resources are left in place"
            );
            BillingError::StepFailed {
                step,
                created: self.created.clone(),
                source: Box::new(source),
            }
        })
    }

    fn created(&mut self, id: &str) {
        self.created.push(id.to_string());
    }
}

impl<P: BillingPlatform + Clone> BillingService<P> {
    /// Flat plan: product, flat monthly price, customer with a default
    /// payment method, single-item subscription
    pub async fn run_flat_plan(
        &self,
        plan: &FlatPlan,
        profile: &CustomerProfile,
    ) -> BillingResult<FlatPlanReport> {
        let started_at = OffsetDateTime::now_utc();
        let mut progress = Progress::default();
        tracing::info!(product = %plan.product_name, "Provisioning flat plan");

        let product = progress
            .step(
                "create_product",
                self.catalog
                    .create_product(&plan.product_name, &plan.product_description),
            )
            .await?;
        progress.created(&product.id);

        let price = progress
            .step("create_price", self.catalog.create_flat_price(plan, &product.id))
            .await?;
        progress.created(&price.id);
        let catalog = FlatCatalog { product, price };

        let customer = self.onboard_customer(&mut progress, profile).await?;

        let subscription = progress
            .step(
                "create_subscription",
                self.subscriptions.create_subscription(
                    &customer.customer_id,
                    &[LineItem::unquantified(&catalog.price.id)],
                ),
            )
            .await?;
        progress.created(&subscription.id);

        let invariants =
            self.invariants
                .check_flat_plan(&catalog.price, &customer.customer_id, &subscription);

        tracing::info!(
            subscription_id = %subscription.id,
            created = progress.created.len(),
            "Flat plan provisioned"
        );

        Ok(FlatPlanReport {
            catalog: catalog.ids(),
            customer,
            subscription: SubscriptionOutcome::from(&subscription),
            invariants,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
        })
    }

    /// Metered plan: product, licensed base price, meter, tiered overage
    /// price, customer, two-item subscription, then one usage event unless
    /// `usage_value` is `None`.
    ///
    /// Running this twice against the same account fails at `create_meter`,
    /// since meter event names are unique per account.
    pub async fn run_metered_plan(
        &self,
        plan: &MeteredPlan,
        profile: &CustomerProfile,
        usage_value: Option<&str>,
    ) -> BillingResult<MeteredPlanReport> {
        let started_at = OffsetDateTime::now_utc();
        let mut progress = Progress::default();
        tracing::info!(
            product = %plan.product_name,
            event_name = %plan.meter.event_name,
            "Provisioning metered plan"
        );

        let product = progress
            .step(
                "create_product",
                self.catalog
                    .create_product(&plan.product_name, &plan.product_description),
            )
            .await?;
        progress.created(&product.id);

        let base_price = progress
            .step("create_base_price", self.catalog.create_base_price(plan, &product.id))
            .await?;
        progress.created(&base_price.id);

        let meter = progress
            .step("create_meter", self.catalog.create_meter(plan))
            .await?;
        progress.created(&meter.id);

        let overage_price = progress
            .step(
                "create_overage_price",
                self.catalog
                    .create_overage_price(plan, &product.id, &meter.id),
            )
            .await?;
        progress.created(&overage_price.price.id);

        let catalog = MeteredCatalog {
            product,
            base_price,
            meter,
            overage_price,
        };

        let customer = self.onboard_customer(&mut progress, profile).await?;

        let subscription = progress
            .step(
                "create_subscription",
                self.subscriptions.create_subscription(
                    &customer.customer_id,
                    &[
                        LineItem::licensed(&catalog.base_price.id, 1),
                        LineItem::unquantified(&catalog.overage_price.price.id),
                    ],
                ),
            )
            .await?;
        progress.created(&subscription.id);

        let event = usage_value
            .map(|value| meter_event_params(&catalog.meter, &customer.customer_id, value));
        let invariants = self.invariants.check_metered_plan(
            &catalog,
            &customer.customer_id,
            Some(&subscription),
            event.as_ref(),
        );

        // Only an event the meter cannot aggregate stops the run. Other
        // violations are left in the report.
        let usage = match (usage_value, event.as_ref()) {
            (Some(value), Some(event)) => {
                if let Some(violation) = self.invariants.meter_event_matches_meter(
                    event,
                    &catalog.meter,
                    &customer.customer_id,
                ) {
                    return progress
                        .step("verify_meter_binding", async move {
                            Err(BillingError::InvariantViolation(violation.description))
                        })
                        .await;
                }

                let report = progress
                    .step(
                        "report_usage",
                        self.metered
                            .report_usage(&catalog.meter, &customer.customer_id, value),
                    )
                    .await?;
                Some(report)
            }
            _ => {
                tracing::info!("Usage reporting skipped");
                None
            }
        };

        let usage_units = usage_value.and_then(|v| v.parse::<u64>().ok());
        let estimated_overage_cents = progress
            .step("estimate_overage", async {
                usage_units
                    .map(|gb| plan.estimated_overage_cents(gb))
                    .transpose()
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            created = progress.created.len(),
            "Metered plan provisioned"
        );

        Ok(MeteredPlanReport {
            catalog: catalog.ids(),
            customer,
            subscription: SubscriptionOutcome::from(&subscription),
            usage,
            estimated_overage_cents,
            invariants,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
        })
    }

    /// Create the customer, then attach and default its payment method, as
    /// two separately tracked steps
    async fn onboard_customer(
        &self,
        progress: &mut Progress,
        profile: &CustomerProfile,
    ) -> BillingResult<OnboardedCustomer> {
        let customer = progress
            .step("create_customer", self.customer.create_customer(profile))
            .await?;
        progress.created(&customer.id);

        let default_payment_method = progress
            .step(
                "set_default_payment_method",
                self.customer.set_default_payment_method(&customer.id),
            )
            .await?;

        Ok(OnboardedCustomer {
            customer_id: customer.id,
            email: customer.email,
            default_payment_method,
        })
    }
}
