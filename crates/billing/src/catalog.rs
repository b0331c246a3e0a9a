//! Catalog setup: products, prices and usage meters

use serde::Serialize;
use stripe::{
    CreatePrice, CreatePriceRecurring, CreatePriceRecurringUsageType, CreatePriceTiers,
    CreateProduct, IdOrCreate, Price, PriceBillingScheme, PriceId, Product, ProductId,
};

use crate::error::BillingResult;
use crate::models::{
    CreateMeterParams, CreateMeteredPriceParams, Meter, MeteredPrice, MeteredPriceRecurring,
};
use crate::plans::{FlatPlan, MeteredPlan};
use crate::platform::BillingPlatform;

/// Catalog created for a flat-rate plan
#[derive(Debug, Clone)]
pub struct FlatCatalog {
    pub product: Product,
    pub price: Price,
}

/// Catalog created for a metered plan
#[derive(Debug, Clone)]
pub struct MeteredCatalog {
    pub product: Product,
    /// Licensed price, billed regardless of usage
    pub base_price: Price,
    pub meter: Meter,
    /// Tiered price fed by the meter
    pub overage_price: MeteredPrice,
}

/// Ids created by a catalog step, for reports and cleanup
#[derive(Debug, Clone, Serialize)]
pub struct CatalogIds {
    pub product_id: ProductId,
    pub price_ids: Vec<PriceId>,
    pub meter_id: Option<String>,
}

impl FlatCatalog {
    pub fn ids(&self) -> CatalogIds {
        CatalogIds {
            product_id: self.product.id.clone(),
            price_ids: vec![self.price.id.clone()],
            meter_id: None,
        }
    }
}

impl MeteredCatalog {
    pub fn ids(&self) -> CatalogIds {
        CatalogIds {
            product_id: self.product.id.clone(),
            price_ids: vec![
                self.base_price.id.clone(),
                self.overage_price.price.id.clone(),
            ],
            meter_id: Some(self.meter.id.clone()),
        }
    }
}

/// Builds the Stripe catalog for a plan
#[derive(Clone)]
pub struct CatalogService<P> {
    platform: P,
}

impl<P: BillingPlatform> CatalogService<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    /// Create a product
    pub async fn create_product(&self, name: &str, description: &str) -> BillingResult<Product> {
        let mut params = CreateProduct::new(name);
        params.description = Some(description);
        let product = self.platform.create_product(params).await?;

        tracing::info!(product_id = %product.id, name = %name, "Created product");
        Ok(product)
    }

    /// Create the product and its flat monthly price
    pub async fn create_flat_plan(&self, plan: &FlatPlan) -> BillingResult<FlatCatalog> {
        let product = self
            .create_product(&plan.product_name, &plan.product_description)
            .await?;
        let price = self.create_flat_price(plan, &product.id).await?;

        Ok(FlatCatalog { product, price })
    }

    /// Create the product, licensed base price, meter and metered overage
    /// price, in that order. The overage price references the meter, so the
    /// meter has to exist first.
    pub async fn create_metered_plan(&self, plan: &MeteredPlan) -> BillingResult<MeteredCatalog> {
        let product = self
            .create_product(&plan.product_name, &plan.product_description)
            .await?;
        let base_price = self.create_base_price(plan, &product.id).await?;
        let meter = self.create_meter(plan).await?;
        let overage_price = self
            .create_overage_price(plan, &product.id, &meter.id)
            .await?;

        Ok(MeteredCatalog {
            product,
            base_price,
            meter,
            overage_price,
        })
    }

    pub async fn create_flat_price(
        &self,
        plan: &FlatPlan,
        product_id: &ProductId,
    ) -> BillingResult<Price> {
        let price = self
            .platform
            .create_price(flat_price_params(plan, product_id))
            .await?;

        tracing::info!(
            price_id = %price.id,
            product_id = %product_id,
            unit_amount = plan.unit_amount_cents,
            currency = %plan.currency,
            "Created flat recurring price"
        );
        Ok(price)
    }

    pub async fn create_base_price(
        &self,
        plan: &MeteredPlan,
        product_id: &ProductId,
    ) -> BillingResult<Price> {
        let price = self
            .platform
            .create_price(base_price_params(plan, product_id))
            .await?;

        tracing::info!(
            price_id = %price.id,
            unit_amount = plan.base_amount_cents,
            "Created licensed base price"
        );
        Ok(price)
    }

    /// Create the tiered overage price, billed from the meter's aggregate
    pub async fn create_overage_price(
        &self,
        plan: &MeteredPlan,
        product_id: &ProductId,
        meter_id: &str,
    ) -> BillingResult<MeteredPrice> {
        let overage = self
            .platform
            .create_metered_price(&overage_price_params(plan, product_id, meter_id))
            .await?;

        tracing::info!(
            price_id = %overage.price.id,
            meter_id = %meter_id,
            bound_meter = overage.meter.as_deref().unwrap_or("none"),
            tiers = plan.tiers.len(),
            "Created metered overage price"
        );
        Ok(overage)
    }

    /// Create the usage meter. Stripe rejects a second meter with the same
    /// `event_name` on the account.
    pub async fn create_meter(&self, plan: &MeteredPlan) -> BillingResult<Meter> {
        let params = CreateMeterParams {
            display_name: plan.meter.display_name.clone(),
            event_name: plan.meter.event_name.clone(),
            default_aggregation: plan.meter.aggregation(),
            customer_mapping: plan.meter.customer_mapping(),
            value_settings: plan.meter.value_settings(),
        };
        let meter = self.platform.create_meter(&params).await?;

        tracing::info!(
            meter_id = %meter.id,
            event_name = %meter.event_name,
            "Created usage meter"
        );
        Ok(meter)
    }
}

pub(crate) fn flat_price_params<'a>(plan: &FlatPlan, product_id: &'a ProductId) -> CreatePrice<'a> {
    let mut params = CreatePrice::new(plan.currency);
    params.product = Some(IdOrCreate::Id(product_id.as_str()));
    params.unit_amount = Some(plan.unit_amount_cents);
    params.recurring = Some(CreatePriceRecurring {
        interval: plan.interval,
        ..Default::default()
    });
    params
}

pub(crate) fn base_price_params<'a>(
    plan: &MeteredPlan,
    product_id: &'a ProductId,
) -> CreatePrice<'a> {
    let mut params = CreatePrice::new(plan.currency);
    params.product = Some(IdOrCreate::Id(product_id.as_str()));
    params.unit_amount = Some(plan.base_amount_cents);
    params.billing_scheme = Some(PriceBillingScheme::PerUnit);
    params.recurring = Some(CreatePriceRecurring {
        interval: plan.interval,
        usage_type: Some(CreatePriceRecurringUsageType::Licensed),
        ..Default::default()
    });
    params
}

pub(crate) fn overage_price_params(
    plan: &MeteredPlan,
    product_id: &ProductId,
    meter_id: &str,
) -> CreateMeteredPriceParams {
    CreateMeteredPriceParams {
        product: product_id.clone(),
        currency: plan.currency,
        billing_scheme: PriceBillingScheme::Tiered,
        recurring: MeteredPriceRecurring {
            interval: plan.interval,
            usage_type: CreatePriceRecurringUsageType::Metered,
            meter: meter_id.to_string(),
        },
        tiers_mode: plan.tiers_mode,
        tiers: plan
            .tiers
            .iter()
            .map(|tier| CreatePriceTiers {
                up_to: Some(tier.up_to),
                unit_amount_decimal: Some(tier.unit_amount_decimal.clone()),
                ..Default::default()
            })
            .collect(),
        nickname: Some(plan.overage_nickname.clone()),
    }
}
