//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Default Stripe API base, used unless `STRIPE_API_BASE` overrides it
pub const DEFAULT_API_BASE: &str = "https://api.stripe.com/";

const LIVE_KEY_PREFIXES: [&str; 2] = ["sk_live_", "rk_live_"];

/// Stripe configuration loaded from the environment
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Base URL of the Stripe API (stripe-mock or a test server in development)
    pub api_base: String,
    /// Allow `sk_live_`/`rk_live_` keys. The workflows create throwaway test
    /// resources, so live keys are refused unless explicitly enabled.
    pub allow_live_keys: bool,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &self.redacted_key())
            .field("api_base", &self.api_base)
            .field("allow_live_keys", &self.allow_live_keys)
            .finish()
    }
}

impl StripeConfig {
    /// Build a config for the given key against the default API base
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            allow_live_keys: false,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let api_base =
            std::env::var("STRIPE_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

        let allow_live_keys = std::env::var("STRIPE_ALLOW_LIVE_KEYS")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let config = Self {
            secret_key,
            api_base,
            allow_live_keys,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject empty keys, and live keys unless they were explicitly allowed
    pub fn validate(&self) -> BillingResult<()> {
        if self.secret_key.trim().is_empty() {
            return Err(BillingError::Config("STRIPE_SECRET_KEY is empty".to_string()));
        }

        if self.is_live_key() && !self.allow_live_keys {
            return Err(BillingError::Config(
                "Refusing to provision with a live Stripe key; set STRIPE_ALLOW_LIVE_KEYS=true to override"
                    .to_string(),
            ));
        }

        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(BillingError::Config(format!(
                "STRIPE_API_BASE must be an http(s) URL, got '{}'",
                self.api_base
            )));
        }

        Ok(())
    }

    pub fn is_live_key(&self) -> bool {
        LIVE_KEY_PREFIXES
            .iter()
            .any(|prefix| self.secret_key.starts_with(prefix))
    }

    /// Key prefix plus the last four characters, safe to log
    pub fn redacted_key(&self) -> String {
        let key = &self.secret_key;
        let prefix_len = key.find('_').and_then(|i| key[i + 1..].find('_').map(|j| i + j + 2));
        let Some(prefix_len) = prefix_len else {
            return "***".to_string();
        };

        // Byte offsets below come from char_indices, so slicing never splits
        // a multibyte character.
        let rest = &key[prefix_len..];
        match rest.char_indices().rev().nth(3) {
            Some((tail_start, _)) if tail_start > 0 => {
                format!("{}...{}", &key[..prefix_len], &rest[tail_start..])
            }
            _ => "***".to_string(),
        }
    }
}

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(config: StripeConfig) -> Self {
        let inner = if config.api_base == DEFAULT_API_BASE {
            Client::new(config.secret_key.clone())
        } else {
            Client::from_url(config.api_base.as_str(), config.secret_key.clone())
        };
        Self { inner, config }
    }

    /// Create from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        tracing::info!(
            key = %config.redacted_key(),
            api_base = %config.api_base,
            "Stripe client configured"
        );
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// Get the configuration
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::remove_var("STRIPE_API_BASE");
        std::env::remove_var("STRIPE_ALLOW_LIVE_KEYS");
    }

    #[test]
    #[serial]
    fn test_from_env_requires_secret_key() {
        clear_env();
        let err = StripeConfig::from_env().unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_key_and_base() {
        clear_env();
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_abcdef123456");
        std::env::set_var("STRIPE_API_BASE", "http://localhost:12111/");

        let config = StripeConfig::from_env().unwrap();
        assert_eq!(config.secret_key, "sk_test_abcdef123456");
        assert_eq!(config.api_base, "http://localhost:12111/");
        assert!(!config.allow_live_keys);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_live_key_refused_without_override() {
        clear_env();
        std::env::set_var("STRIPE_SECRET_KEY", "sk_live_abcdef123456");
        assert!(matches!(
            StripeConfig::from_env(),
            Err(BillingError::Config(_))
        ));

        std::env::set_var("STRIPE_ALLOW_LIVE_KEYS", "true");
        let config = StripeConfig::from_env().unwrap();
        assert!(config.is_live_key());
        clear_env();
    }

    #[test]
    fn test_restricted_test_key_accepted() {
        let config = StripeConfig::new("rk_test_51abcdefXYZ9");
        assert!(config.validate().is_ok());
        assert!(!config.is_live_key());
    }

    #[test]
    fn test_api_base_must_be_http() {
        let mut config = StripeConfig::new("sk_test_abcdef123456");
        config.api_base = "localhost:12111".to_string();
        assert!(matches!(config.validate(), Err(BillingError::Config(_))));
    }

    #[test]
    fn test_redacted_key_hides_secret() {
        let config = StripeConfig::new("sk_test_51HxyzSECRETabcd");
        assert_eq!(config.redacted_key(), "sk_test_...abcd");
        assert!(!format!("{:?}", config).contains("SECRET"));

        let short = StripeConfig::new("sk_test_ab");
        assert_eq!(short.redacted_key(), "***");
    }

    #[test]
    fn test_redacted_key_with_multibyte_characters() {
        let config = StripeConfig::new("sk_test_abcdef€abc");
        assert_eq!(config.redacted_key(), "sk_test_...€abc");

        let tail = StripeConfig::new("sk_test_xyzé€ü");
        assert_eq!(tail.redacted_key(), "sk_test_...zé€ü");

        let four_chars = StripeConfig::new("sk_test_é€üà");
        assert_eq!(four_chars.redacted_key(), "***");
    }
}
