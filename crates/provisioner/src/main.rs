// Provisioner clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Streamplan Provisioner
//!
//! Provisions one streaming subscription plan on Stripe and prints a JSON
//! report of everything it created:
//! - `flat`: Plan A, $24.99/month unlimited
//! - `metered`: Plan B, $10.99/month for 100 GB plus tiered GB overage
//!
//! Intended for Stripe sandbox accounts. Requires `STRIPE_SECRET_KEY` unless
//! `--dry-run` is given.

use clap::{Parser, Subcommand};
use serde::Serialize;
use streamplan_billing::{
    BillingPlatform, BillingService, CustomerProfile, FlatPlan, MeteredPlan, MockPlatform,
    DEFAULT_USAGE_VALUE,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "streamplan")]
#[command(about = "Provision streaming subscription plans on Stripe", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run against an in-memory platform instead of Stripe
    #[arg(long, global = true)]
    dry_run: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Flat-rate monthly plan with a single price
    Flat,
    /// Metered plan with a licensed base price and GB overage
    Metered {
        /// Skip reporting the usage event after subscribing
        #[arg(long)]
        skip_usage: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run<P: BillingPlatform + Clone>(
    billing: &BillingService<P>,
    command: &Commands,
) -> anyhow::Result<String> {
    match command {
        Commands::Flat => {
            let report = billing
                .run_flat_plan(
                    &FlatPlan::streaming_unlimited(),
                    &CustomerProfile::test_user_a(),
                )
                .await?;
            render(&report)
        }
        Commands::Metered { skip_usage } => {
            let usage = (!skip_usage).then_some(DEFAULT_USAGE_VALUE);
            let report = billing
                .run_metered_plan(
                    &MeteredPlan::streaming_per_gb(),
                    &CustomerProfile::test_user_b(),
                    usage,
                )
                .await?;
            render(&report)
        }
    }
}

fn render<T: Serialize>(report: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    init_tracing(cli.json_logs);

    info!("Starting Streamplan Provisioner v{}", env!("CARGO_PKG_VERSION"));

    let output = if cli.dry_run {
        info!("Dry run: using in-memory platform, nothing is sent to Stripe");
        let billing = BillingService::with_platform(MockPlatform::new());
        run(&billing, &cli.command).await?
    } else {
        let billing = BillingService::from_env()?;
        run(&billing, &cli.command).await?
    };

    println!("{}", output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_metered_flags() {
        let cli = Cli::try_parse_from(["streamplan", "--dry-run", "metered", "--skip-usage"]).unwrap();
        assert!(cli.dry_run);
        assert!(matches!(cli.command, Commands::Metered { skip_usage: true }));
    }

    #[tokio::test]
    async fn test_dry_run_flat_report_is_json() {
        let billing = BillingService::with_platform(MockPlatform::new());
        let output = run(&billing, &Commands::Flat).await.unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(value["catalog"]["product_id"]
            .as_str()
            .unwrap()
            .starts_with("prod_"));
        assert_eq!(value["subscription"]["first_charge_status"], "succeeded");
    }

    #[tokio::test]
    async fn test_dry_run_metered_report_includes_usage() {
        let billing = BillingService::with_platform(MockPlatform::new());
        let output = run(&billing, &Commands::Metered { skip_usage: false })
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["usage"]["value"], "150");
        assert_eq!(value["estimated_overage_cents"], 500);
        assert_eq!(value["invariants"]["healthy"], true);
    }
}
