//! Payment provider used by the checkout function.

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::CheckoutError;

const STRIPE_API_URL: &str = "https://api.stripe.com";

/// Customer to create at the provider, tagged with our ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerParams {
    pub email: String,
    pub agency_id: String,
    pub user_id: String,
}

/// A hosted subscription checkout with a single line item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a customer and return its provider id.
    async fn create_customer(&self, params: &CustomerParams) -> Result<String, CheckoutError>;
    /// Create a checkout session and return its URL.
    async fn create_checkout_session(&self, params: &SessionParams) -> Result<String, CheckoutError>;
}

/// Used when no secret key is configured.
pub struct DisabledProvider;

#[async_trait]
impl PaymentProvider for DisabledProvider {
    async fn create_customer(&self, _params: &CustomerParams) -> Result<String, CheckoutError> {
        Err(CheckoutError::NotConfigured)
    }

    async fn create_checkout_session(&self, _params: &SessionParams) -> Result<String, CheckoutError> {
        Err(CheckoutError::NotConfigured)
    }
}

#[derive(Debug, Deserialize)]
struct StripeObject {
    id: Option<String>,
    url: Option<String>,
    error: Option<StripeErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
}

/// Stripe over its form-encoded REST API.
pub struct StripeProvider {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl StripeProvider {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self::with_base_url(secret_key, STRIPE_API_URL)
    }

    pub fn with_base_url(secret_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<StripeObject, CheckoutError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| CheckoutError::Provider(format!("request to {} failed: {}", path, e)))?;

        let status = resp.status();
        let body: StripeObject = resp
            .json()
            .await
            .map_err(|e| CheckoutError::Provider(format!("invalid response from {}: {}", path, e)))?;

        if !status.is_success() {
            let message = body
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(CheckoutError::Provider(message));
        }
        Ok(body)
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_customer(&self, params: &CustomerParams) -> Result<String, CheckoutError> {
        let form = [
            ("email", params.email.as_str()),
            ("metadata[agency_id]", params.agency_id.as_str()),
            ("metadata[user_id]", params.user_id.as_str()),
        ];
        self.post_form("/v1/customers", &form)
            .await?
            .id
            .ok_or_else(|| CheckoutError::Provider("customer response had no id".into()))
    }

    async fn create_checkout_session(&self, params: &SessionParams) -> Result<String, CheckoutError> {
        let form = [
            ("customer", params.customer_id.as_str()),
            ("mode", "subscription"),
            ("line_items[0][price]", params.price_id.as_str()),
            ("line_items[0][quantity]", "1"),
            ("success_url", params.success_url.as_str()),
            ("cancel_url", params.cancel_url.as_str()),
        ];
        self.post_form("/v1/checkout/sessions", &form)
            .await?
            .url
            .ok_or_else(|| CheckoutError::Provider("checkout session had no url".into()))
    }
}
